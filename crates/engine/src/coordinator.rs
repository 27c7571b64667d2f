//! Agent selection.
//!
//! A [`Coordinator`] narrows the candidate list to `Running` agents and asks
//! a [`SelectionStrategy`] to pick one. Filtering strategies wrap another
//! strategy, so a config like "health-aware, capability-matching,
//! least-loaded" is a three-layer stack.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use queue::Task;

use crate::agent::{Agent, AgentHealth, AgentState};
use crate::config::{CoordinatorConfig, StrategyKind};
use crate::error::{OrchestratorError, Result};

pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> String;

    /// Pick one of `candidates`, or `None` when none fit.
    fn select(&self, task: &Task, candidates: &[Arc<Agent>]) -> Option<Arc<Agent>>;
}

// ---------------------------------------------------------------------------
// Base strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> String {
        "round_robin".into()
    }

    fn select(&self, _task: &Task, candidates: &[Arc<Agent>]) -> Option<Arc<Agent>> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        candidates.get(idx % candidates.len()).cloned()
    }
}

/// Lowest current load wins; ties go to the earliest candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn name(&self) -> String {
        "least_loaded".into()
    }

    fn select(&self, _task: &Task, candidates: &[Arc<Agent>]) -> Option<Arc<Agent>> {
        candidates.iter().min_by_key(|a| a.load()).cloned()
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Keeps agents declaring every capability the task requires.
pub struct CapabilityMatching {
    inner: Box<dyn SelectionStrategy>,
}

impl CapabilityMatching {
    pub fn new(inner: Box<dyn SelectionStrategy>) -> Self {
        Self { inner }
    }
}

impl SelectionStrategy for CapabilityMatching {
    fn name(&self) -> String {
        format!("capability_matching({})", self.inner.name())
    }

    fn select(&self, task: &Task, candidates: &[Arc<Agent>]) -> Option<Arc<Agent>> {
        let matching: Vec<Arc<Agent>> = candidates
            .iter()
            .filter(|a| a.has_capabilities(&task.required_capabilities))
            .cloned()
            .collect();
        self.inner.select(task, &matching)
    }
}

/// Drops agents whose health is below `min_health`.
pub struct HealthAware {
    min_health: AgentHealth,
    inner: Box<dyn SelectionStrategy>,
}

impl HealthAware {
    pub fn new(min_health: AgentHealth, inner: Box<dyn SelectionStrategy>) -> Self {
        Self { min_health, inner }
    }
}

impl SelectionStrategy for HealthAware {
    fn name(&self) -> String {
        format!("health_aware>={}({})", self.min_health, self.inner.name())
    }

    fn select(&self, task: &Task, candidates: &[Arc<Agent>]) -> Option<Arc<Agent>> {
        let healthy: Vec<Arc<Agent>> = candidates
            .iter()
            .filter(|a| a.health() >= self.min_health)
            .cloned()
            .collect();
        self.inner.select(task, &healthy)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    strategy: Box<dyn SelectionStrategy>,
}

impl Coordinator {
    pub fn new(strategy: Box<dyn SelectionStrategy>) -> Self {
        Self { strategy }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        let mut strategy: Box<dyn SelectionStrategy> = match config.strategy {
            StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
            StrategyKind::LeastLoaded => Box::new(LeastLoaded),
        };
        if config.match_capabilities {
            strategy = Box::new(CapabilityMatching::new(strategy));
        }
        if config.health_aware {
            strategy = Box::new(HealthAware::new(config.min_health, strategy));
        }
        Self::new(strategy)
    }

    pub fn strategy_name(&self) -> String {
        self.strategy.name()
    }

    /// Choose an agent for `task`. Only `Running` candidates are considered.
    pub fn select_agent(&self, task: &Task, candidates: &[Arc<Agent>]) -> Result<Arc<Agent>> {
        let running: Vec<Arc<Agent>> = candidates
            .iter()
            .filter(|a| a.state() == AgentState::Running)
            .cloned()
            .collect();

        let chosen = self
            .strategy
            .select(task, &running)
            .ok_or_else(|| OrchestratorError::NoEligibleAgent {
                task_type: task.task_type.clone(),
            })?;

        debug!(
            "selected agent {} (load {}) for task {} via {}",
            chosen.id,
            chosen.load(),
            task.id,
            self.strategy.name()
        );
        Ok(chosen)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentSpec};
    use serde_json::json;

    fn running_agent(name: &str, load: usize, caps: &[&str]) -> Arc<Agent> {
        let agent = Agent::new(
            AgentSpec::new(name, "generic").with_capabilities(caps.iter().copied()),
            &AgentConfig::default(),
        );
        agent.transition(AgentState::Running).unwrap();
        for _ in 0..load {
            agent.increment_load();
        }
        Arc::new(agent)
    }

    fn task() -> Task {
        Task::new("index", json!(null))
    }

    #[test]
    fn least_loaded_picks_minimum_and_load_is_bumped() {
        let agents = vec![
            running_agent("a", 3, &[]),
            running_agent("b", 1, &[]),
            running_agent("c", 4, &[]),
        ];
        let coordinator = Coordinator::new(Box::new(LeastLoaded));

        let chosen = coordinator.select_agent(&task(), &agents).unwrap();
        assert_eq!(chosen.name, "b");

        // The runtime bumps load when it accepts the assignment.
        chosen.increment_load();
        assert_eq!(agents[1].load(), 2);
    }

    #[test]
    fn round_robin_cycles() {
        let agents = vec![running_agent("a", 0, &[]), running_agent("b", 0, &[])];
        let coordinator = Coordinator::new(Box::new(RoundRobin::new()));
        let names: Vec<String> = (0..4)
            .map(|_| coordinator.select_agent(&task(), &agents).unwrap().name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn only_running_agents_are_eligible() {
        let paused = running_agent("paused", 0, &[]);
        paused.transition(AgentState::Paused).unwrap();
        let created = Arc::new(Agent::new(AgentSpec::new("new", "generic"), &AgentConfig::default()));

        let coordinator = Coordinator::default();
        let err = coordinator.select_agent(&task(), &[paused, created]).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NoEligibleAgent { task_type } if task_type == "index"
        ));
    }

    #[test]
    fn capability_matching_filters_before_inner_strategy() {
        let agents = vec![
            running_agent("cpu", 0, &["linux"]),
            running_agent("gpu", 5, &["linux", "gpu"]),
        ];
        let coordinator = Coordinator::new(Box::new(CapabilityMatching::new(Box::new(LeastLoaded))));

        let needs_gpu = task().requiring(["gpu"]);
        assert_eq!(coordinator.select_agent(&needs_gpu, &agents).unwrap().name, "gpu");

        let needs_tpu = task().requiring(["tpu"]);
        assert!(coordinator.select_agent(&needs_tpu, &agents).is_err());
    }

    #[test]
    fn health_aware_drops_unhealthy_agents() {
        let sick = running_agent("sick", 0, &[]);
        sick.set_health(AgentHealth::Unhealthy);
        let tired = running_agent("tired", 2, &[]);
        tired.set_health(AgentHealth::Degraded);
        let agents = vec![sick, tired];

        let coordinator = Coordinator::from_config(&CoordinatorConfig::default());
        assert_eq!(coordinator.select_agent(&task(), &agents).unwrap().name, "tired");

        let strict = Coordinator::from_config(&CoordinatorConfig {
            min_health: AgentHealth::Healthy,
            ..CoordinatorConfig::default()
        });
        assert!(strict.select_agent(&task(), &agents).is_err());
    }

    #[test]
    fn config_builds_layered_strategy() {
        let coordinator = Coordinator::from_config(&CoordinatorConfig::default());
        assert_eq!(
            coordinator.strategy_name(),
            "health_aware>=degraded(capability_matching(least_loaded))"
        );
    }
}
