//! Counters shared by the runtime, engine and scheduler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use queue::TaskStatus;

use crate::agent::AgentState;

#[derive(Debug, Default)]
pub struct Metrics {
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_timed_out: AtomicU64,
    tasks_cancelled: AtomicU64,
    active_executions: AtomicUsize,
    executions_started: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self, status: TaskStatus) {
        let counter = match status {
            TaskStatus::Completed => &self.tasks_completed,
            TaskStatus::Failed => &self.tasks_failed,
            TaskStatus::TimedOut => &self.tasks_timed_out,
            TaskStatus::Cancelled => &self.tasks_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_started(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_finished(&self) {
        let _ = self
            .active_executions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    pub fn active_executions(&self) -> usize {
        self.active_executions.load(Ordering::Relaxed)
    }

    /// Fill the counter fields of a snapshot. Agent and queue figures are
    /// added by the caller that owns them.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            active_executions: self.active_executions(),
            executions_started: self.executions_started.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub agents_total: usize,
    pub agents_by_state: BTreeMap<AgentState, usize>,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    /// Mean current depth of the agents' private queues.
    pub average_agent_queue_depth: f64,
    /// Mean depth of the global queue over its lifetime.
    pub average_global_queue_depth: f64,
    pub global_queue_depth: usize,
    pub active_executions: usize,
    pub executions_started: u64,
}
