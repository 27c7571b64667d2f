//! Errors surfaced by repository implementations.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("document not found")]
    NotFound,

    #[error("document {0} already exists")]
    Conflict(Uuid),

    #[error("cannot apply migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("document is not valid JSON for its type: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Sqlx(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        )
    }
}
