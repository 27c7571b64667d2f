//! The `Repository` contract and its implementations.
//!
//! Every method addresses a document by `(collection, id)` and returns a
//! `Result<T, DbError>`. No business logic and no domain types: JSON in, JSON out.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::{Collection, DbError, DocumentRow};

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a new document.
    ///
    /// # Errors
    /// [`DbError::Conflict`] if the id is already taken in that collection.
    async fn create(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError>;

    /// Fetch one document. [`DbError::NotFound`] if absent.
    async fn get(&self, collection: Collection, id: Uuid) -> Result<DocumentRow, DbError>;

    /// Replace an existing document. [`DbError::NotFound`] if absent.
    async fn update(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError>;

    /// Delete one document. [`DbError::NotFound`] if nothing was deleted.
    async fn delete(&self, collection: Collection, id: Uuid) -> Result<(), DbError>;

    /// All documents of a collection, oldest first.
    async fn list(&self, collection: Collection) -> Result<Vec<DocumentRow>, DbError>;

    /// Insert or replace.
    async fn upsert(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        match self.update(collection, id, document.clone()).await {
            Err(DbError::NotFound) => self.create(collection, id, document).await,
            other => other,
        }
    }
}
