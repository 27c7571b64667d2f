//! Health provider contract.
//!
//! Health probes live outside the orchestrator; the runtime only polls a
//! [`HealthProvider`] and stores what it reports.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::agent::AgentHealth;

#[async_trait]
pub trait HealthProvider: Send + Sync {
    async fn get_health(&self, agent_id: Uuid) -> anyhow::Result<AgentHealth>;
}

/// Reports whatever was last `set` for an agent, or a fixed default.
#[derive(Debug)]
pub struct StaticHealthProvider {
    default: AgentHealth,
    overrides: RwLock<HashMap<Uuid, AgentHealth>>,
}

impl StaticHealthProvider {
    pub fn new(default: AgentHealth) -> Self {
        Self {
            default,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, agent_id: Uuid, health: AgentHealth) {
        self.overrides.write().insert(agent_id, health);
    }
}

impl Default for StaticHealthProvider {
    fn default() -> Self {
        Self::new(AgentHealth::Healthy)
    }
}

#[async_trait]
impl HealthProvider for StaticHealthProvider {
    async fn get_health(&self, agent_id: Uuid) -> anyhow::Result<AgentHealth> {
        Ok(self
            .overrides
            .read()
            .get(&agent_id)
            .copied()
            .unwrap_or(self.default))
    }
}
