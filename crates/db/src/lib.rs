//! `db` crate: pure persistence layer.
//!
//! Stores orchestrator state as JSON documents grouped into collections.
//! Provides the [`Repository`] trait, an in-memory implementation used by
//! default and in tests, and a Postgres implementation backed by a single
//! `documents` table. No business logic lives here.

pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use models::{Collection, DocumentRow};
pub use pool::{DbPool, PoolOptions};
pub use repository::{InMemoryRepository, PgRepository, Repository};
