//! Row structs that map onto the `documents` table.
//!
//! These are *persistence* models and carry no domain behaviour.
//! Domain types live in the `engine` and `queue` crates and are stored here
//! as their JSON serialisation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// The document collections the orchestrator persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Agents,
    Tasks,
    Workflows,
    Executions,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agents => "agents",
            Self::Tasks => "tasks",
            Self::Workflows => "workflows",
            Self::Executions => "executions",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Collection {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agents"     => Ok(Self::Agents),
            "tasks"      => Ok(Self::Tasks),
            "workflows"  => Ok(Self::Workflows),
            "executions" => Ok(Self::Executions),
            other        => Err(format!("unknown collection: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// documents
// ---------------------------------------------------------------------------

/// A persisted document row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DocumentRow {
    pub id: Uuid,
    pub collection: String,
    /// Full JSON serialisation of the domain object.
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
