//! Agents and their lifecycle state machine.
//!
//! An [`Agent`] keeps its identity immutable and its mutable fields behind a
//! per-agent lock. Load and counters are atomics so the coordinator can read
//! them without taking any lock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

// ---------------------------------------------------------------------------
// State & health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl AgentState {
    /// The allowed-transition table.
    ///
    /// `Failed` is entered only by the runtime when the failure threshold
    /// trips, and left only through a restart.
    pub fn can_transition_to(self, to: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Stopped, Running)
                | (Running, Failed)
                | (Paused, Failed)
                | (Failed, Running)
        )
    }

    /// States in which the agent has a live worker.
    pub fn is_active(self) -> bool {
        matches!(self, AgentState::Running | AgentState::Paused)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Externally reported health, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Unhealthy,
    Degraded,
    Healthy,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Healthy => write!(f, "healthy"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config & spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 1 means the agent runs its tasks sequentially.
    pub max_concurrent_tasks: usize,
    /// Capacity of the agent's private queue.
    pub queue_capacity: usize,
    pub heartbeat_interval_ms: u64,
    /// Used when a task carries no timeout of its own.
    pub default_task_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 1,
            queue_capacity: 100,
            heartbeat_interval_ms: 30_000,
            default_task_timeout_ms: 300_000,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_concurrent_tasks == 0 {
            return Err("max_concurrent_tasks must be at least 1".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".into());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than zero".into());
        }
        if self.default_task_timeout_ms == 0 {
            return Err("default_task_timeout_ms must be greater than zero".into());
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }
}

/// What a caller supplies to create an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Falls back to the runtime's agent defaults.
    #[serde(default)]
    pub config: Option<AgentConfig>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            ..Self::default()
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Validation("agent name must not be empty".into()));
        }
        if self.agent_type.trim().is_empty() {
            return Err(OrchestratorError::Validation("agent type must not be empty".into()));
        }
        if let Some(config) = &self.config {
            config.validate().map_err(OrchestratorError::Validation)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AgentStatus {
    state: AgentState,
    health: AgentHealth,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub config: AgentConfig,
    pub created_at: DateTime<Utc>,
    status: RwLock<AgentStatus>,
    load: AtomicUsize,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    consecutive_failures: AtomicU32,
    /// Set while a stop drains the worker.
    stopping: AtomicBool,
}

impl Agent {
    pub fn new(spec: AgentSpec, defaults: &AgentConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            agent_type: spec.agent_type,
            capabilities: spec.capabilities.into_iter().collect(),
            config: spec.config.unwrap_or_else(|| defaults.clone()),
            created_at: Utc::now(),
            status: RwLock::new(AgentStatus {
                state: AgentState::Created,
                health: AgentHealth::Healthy,
                started_at: None,
                stopped_at: None,
                last_heartbeat: None,
                last_error: None,
            }),
            load: AtomicUsize::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    /// Rebuild an agent from a persisted snapshot, in the given state.
    pub fn restore(snapshot: &AgentSnapshot, state: AgentState) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name.clone(),
            agent_type: snapshot.agent_type.clone(),
            capabilities: snapshot.capabilities.clone(),
            config: snapshot.config.clone(),
            created_at: snapshot.created_at,
            status: RwLock::new(AgentStatus {
                state,
                health: snapshot.health,
                started_at: snapshot.started_at,
                stopped_at: snapshot.stopped_at,
                last_heartbeat: snapshot.last_heartbeat,
                last_error: snapshot.last_error.clone(),
            }),
            load: AtomicUsize::new(0),
            tasks_completed: AtomicU64::new(snapshot.tasks_completed),
            tasks_failed: AtomicU64::new(snapshot.tasks_failed),
            consecutive_failures: AtomicU32::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> AgentState {
        self.status.read().state
    }

    pub fn health(&self) -> AgentHealth {
        self.status.read().health
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.status.read().last_heartbeat
    }

    /// Apply a transition if the table allows it; returns the previous state.
    pub fn transition(&self, to: AgentState) -> Result<AgentState> {
        let mut status = self.status.write();
        let from = status.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidStateTransition { from, to });
        }
        let now = Utc::now();
        status.state = to;
        match to {
            AgentState::Running if from != AgentState::Paused => {
                status.started_at = Some(now);
                status.stopped_at = None;
                status.last_heartbeat = Some(now);
            }
            AgentState::Stopped | AgentState::Failed => status.stopped_at = Some(now),
            _ => {}
        }
        Ok(from)
    }

    /// Move to `Failed` from `Running` or `Paused`. Returns the previous state,
    /// or `None` if the agent was already elsewhere (e.g. being stopped).
    pub fn fail(&self, reason: impl Into<String>) -> Option<AgentState> {
        let mut status = self.status.write();
        let from = status.state;
        if self.is_stopping() || !from.can_transition_to(AgentState::Failed) {
            return None;
        }
        status.state = AgentState::Failed;
        status.stopped_at = Some(Utc::now());
        status.last_error = Some(reason.into());
        Some(from)
    }

    /// A stopping agent keeps its state until its worker has drained, but
    /// takes no new work and cannot trip into `Failed`.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopping(&self, stopping: bool) {
        self.stopping.store(stopping, Ordering::Release);
    }

    /// Replace the health value; returns the previous one.
    pub fn set_health(&self, health: AgentHealth) -> AgentHealth {
        std::mem::replace(&mut self.status.write().health, health)
    }

    pub fn heartbeat(&self) {
        self.status.write().last_heartbeat = Some(Utc::now());
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    // -----------------------------------------------------------------------
    // Load & counters
    // -----------------------------------------------------------------------

    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    pub fn increment_load(&self) -> usize {
        self.load.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement_load(&self) -> usize {
        let prev = self
            .load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |l| Some(l.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn record_success(&self) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Count a failed task; returns the consecutive failure count.
    pub fn record_failure(&self, error: &str) -> u32 {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.status.write().last_error = Some(error.to_owned());
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.status.write().last_error = None;
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let status = self.status.read().clone();
        AgentSnapshot {
            id: self.id,
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            capabilities: self.capabilities.clone(),
            config: self.config.clone(),
            state: status.state,
            health: status.health,
            load: self.load(),
            tasks_completed: self.tasks_completed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures(),
            created_at: self.created_at,
            started_at: status.started_at,
            stopped_at: status.stopped_at,
            last_heartbeat: status.last_heartbeat,
            last_error: status.last_error,
        }
    }
}

/// Point-in-time, serialisable view of an agent. Also the persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: Uuid,
    pub name: String,
    pub agent_type: String,
    pub capabilities: BTreeSet<String>,
    pub config: AgentConfig,
    pub state: AgentState,
    pub health: AgentHealth,
    pub load: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
