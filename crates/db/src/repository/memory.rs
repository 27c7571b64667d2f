//! Process-local repository. The default store, and the one tests use.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::Repository;
use crate::{Collection, DbError, DocumentRow};

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    collections: RwLock<HashMap<Collection, BTreeMap<Uuid, DocumentRow>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently stored in `collection`.
    pub fn count(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        let mut collections = self.collections.write();
        let docs = collections.entry(collection).or_default();
        if docs.contains_key(&id) {
            return Err(DbError::Conflict(id));
        }
        let now = Utc::now();
        let row = DocumentRow {
            id,
            collection: collection.as_str().to_owned(),
            document,
            created_at: now,
            updated_at: now,
        };
        docs.insert(id, row.clone());
        Ok(row)
    }

    async fn get(&self, collection: Collection, id: Uuid) -> Result<DocumentRow, DbError> {
        self.collections
            .read()
            .get(&collection)
            .and_then(|docs| docs.get(&id))
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn update(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        let mut collections = self.collections.write();
        let row = collections
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(&id))
            .ok_or(DbError::NotFound)?;
        row.document = document;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<(), DbError> {
        self.collections
            .write()
            .get_mut(&collection)
            .and_then(|docs| docs.remove(&id))
            .map(|_| ())
            .ok_or(DbError::NotFound)
    }

    async fn list(&self, collection: Collection) -> Result<Vec<DocumentRow>, DbError> {
        let mut rows: Vec<DocumentRow> = self
            .collections
            .read()
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}
