//! Orchestrator configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Durations are plain millisecond integers; the accessor methods convert
//! them to [`Duration`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, AgentHealth};
use crate::error::{OrchestratorError, Result};

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub runtime: RuntimeConfig,
    /// Defaults applied to agents created without an explicit config.
    pub agent: AgentConfig,
    pub engine: EngineConfig,
    pub coordinator: CoordinatorConfig,
    pub queue: QueueConfig,
}

impl OrchestratorConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject values that would make the orchestrator stall or spin.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(OrchestratorError::Config(format!("{name} must be greater than zero")));
            }
            Ok(())
        }

        positive("runtime.max_agents", self.runtime.max_agents as u64)?;
        positive("runtime.failure_threshold", self.runtime.failure_threshold as u64)?;
        positive("engine.max_concurrent_tasks_per_batch", self.engine.max_concurrent_tasks_per_batch as u64)?;
        positive("engine.max_concurrent_executions", self.engine.max_concurrent_executions as u64)?;
        positive("engine.retention_sweep_interval_ms", self.engine.retention_sweep_interval_ms)?;
        positive("queue.capacity", self.queue.capacity as u64)?;
        positive("queue.promote_interval_ms", self.queue.promote_interval_ms)?;
        positive("queue.dispatch_retry_interval_ms", self.queue.dispatch_retry_interval_ms)?;

        if !(self.engine.backoff_multiplier >= 1.0) {
            return Err(OrchestratorError::Config(
                "engine.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.engine.retry_base_delay_ms > self.engine.retry_max_delay_ms {
            return Err(OrchestratorError::Config(
                "engine.retry_base_delay_ms must not exceed engine.retry_max_delay_ms".into(),
            ));
        }

        self.agent
            .validate()
            .map_err(|e| OrchestratorError::Config(format!("agent: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_agents: usize,
    /// How long a stopping agent may drain in-flight tasks.
    pub stop_grace_period_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Consecutive task failures that move an agent to `Failed`.
    pub failure_threshold: u32,
    /// Health provider poll interval. Polling is off when unset.
    pub health_poll_interval_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            stop_grace_period_ms: 5_000,
            shutdown_timeout_ms: 30_000,
            failure_threshold: 5,
            health_poll_interval_ms: None,
        }
    }
}

impl RuntimeConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Tuning knobs for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_tasks_per_batch: usize,
    pub max_concurrent_executions: usize,
    /// Retries after the first attempt, unless the node overrides it.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// How long in-flight tasks get to stop after an execution is cancelled.
    pub cancel_grace_period_ms: u64,
    /// Finished executions older than this are dropped from memory. The
    /// repository keeps them.
    pub execution_retention_ms: u64,
    pub retention_sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks_per_batch: 4,
            max_concurrent_executions: 16,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            cancel_grace_period_ms: 5_000,
            execution_retention_ms: 86_400_000,
            retention_sweep_interval_ms: 3_600_000,
        }
    }
}

impl EngineConfig {
    /// Back-off before retrying after the given 1-based failed attempt:
    /// `min(base * multiplier^(attempt-1), max)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.retry_base_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = millis.min(self.retry_max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    pub fn execution_retention(&self) -> Duration {
        Duration::from_millis(self.execution_retention_ms)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.retention_sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastLoaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub strategy: StrategyKind,
    /// Only offer tasks to agents declaring every required capability.
    pub match_capabilities: bool,
    /// Drop agents below `min_health` before any other strategy runs.
    pub health_aware: bool,
    pub min_health: AgentHealth,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::LeastLoaded,
            match_capabilities: true,
            health_aware: true,
            min_health: AgentHealth::Degraded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub promote_interval_ms: u64,
    /// Wait before re-trying to place a task no agent could take.
    pub dispatch_retry_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            promote_interval_ms: 250,
            dispatch_retry_interval_ms: 50,
        }
    }
}

impl QueueConfig {
    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms)
    }

    pub fn dispatch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_interval_ms)
    }
}
