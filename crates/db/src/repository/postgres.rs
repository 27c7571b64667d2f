//! Postgres-backed repository over the `documents` table.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::Repository;
use crate::{Collection, DbError, DocumentRow};

const COLUMNS: &str = "id, collection, document, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn create(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            INSERT INTO documents (collection, id, document, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (collection, id) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(collection.as_str())
        .bind(id)
        .bind(document)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::Conflict(id))?;

        Ok(row)
    }

    async fn get(&self, collection: Collection, id: Uuid) -> Result<DocumentRow, DbError> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {COLUMNS} FROM documents WHERE collection = $1 AND id = $2"
        ))
        .bind(collection.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(row)
    }

    async fn update(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            UPDATE documents SET document = $3, updated_at = NOW()
            WHERE collection = $1 AND id = $2
            RETURNING {COLUMNS}
            "#
        ))
        .bind(collection.as_str())
        .bind(id)
        .bind(document)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(row)
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<(), DbError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<DocumentRow>, DbError> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {COLUMNS} FROM documents WHERE collection = $1 ORDER BY created_at ASC"
        ))
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn upsert(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            r#"
            INSERT INTO documents (collection, id, document, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (collection, id)
            DO UPDATE SET document = EXCLUDED.document, updated_at = NOW()
            RETURNING {COLUMNS}
            "#
        ))
        .bind(collection.as_str())
        .bind(id)
        .bind(document)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }
}
