//! Postgres connection setup for the document store.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::{DbError, PgRepository};

pub type DbPool = PgPool;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: u32,
    /// How long a caller waits for a free connection before erroring.
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

pub async fn connect(database_url: &str, options: &PoolOptions) -> Result<DbPool, DbError> {
    info!(
        "connecting to database (max_connections={}, acquire_timeout={:?})",
        options.max_connections, options.acquire_timeout
    );
    let pool = PgPoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(options.acquire_timeout)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("documents schema is up to date");
    Ok(())
}

/// Connect, migrate and wrap the pool in a [`PgRepository`].
pub async fn open_repository(database_url: &str, options: &PoolOptions) -> Result<PgRepository, DbError> {
    let pool = connect(database_url, options).await?;
    run_migrations(&pool).await?;
    Ok(PgRepository::new(pool))
}
