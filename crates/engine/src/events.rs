//! Fire-and-forget event publishing.
//!
//! Publishers are called inline from the runtime and engine, so
//! [`EventPublisher::publish`] must never block.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use queue::TaskStatus;

use crate::agent::{AgentHealth, AgentState};
use crate::models::{ExecutionStatus, TaskState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentStateChanged {
        agent_id: Uuid,
        from: AgentState,
        to: AgentState,
        at: DateTime<Utc>,
    },
    AgentHealthChanged {
        agent_id: Uuid,
        from: AgentHealth,
        to: AgentHealth,
    },
    TaskCompleted {
        task_id: Uuid,
        agent_id: Uuid,
        task_type: String,
        status: TaskStatus,
        attempt: u32,
        duration_ms: u64,
    },
    ExecutionStatusChanged {
        execution_id: Uuid,
        workflow_id: Uuid,
        status: ExecutionStatus,
    },
    NodeStateChanged {
        execution_id: Uuid,
        node_id: String,
        state: TaskState,
    },
    /// Published after each batch; `progress` runs from 0.0 to 1.0.
    ExecutionProgress {
        execution_id: Uuid,
        progress: f64,
    },
}

impl OrchestratorEvent {
    pub fn agent_state(agent_id: Uuid, from: AgentState, to: AgentState) -> Self {
        Self::AgentStateChanged {
            agent_id,
            from,
            to,
            at: Utc::now(),
        }
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: OrchestratorEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: OrchestratorEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: OrchestratorEvent) {
        match &event {
            OrchestratorEvent::AgentStateChanged { agent_id, from, to, .. } => {
                info!("agent {} {} -> {}", agent_id, from, to);
            }
            OrchestratorEvent::ExecutionStatusChanged { execution_id, status, .. } => {
                info!("execution {} is now {:?}", execution_id, status);
            }
            other => debug!(event = ?other, "orchestrator event"),
        }
    }
}

/// Fans events out to any number of `tokio::sync::broadcast` subscribers.
///
/// Slow subscribers lag and lose the oldest events; the publisher never waits.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: OrchestratorEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
