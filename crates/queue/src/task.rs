//! Task and task-result models.
//!
//! These types travel from the caller through the global queue to an agent's
//! worker and back. They are plain data; scheduling decisions live elsewhere.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A discrete unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identity, preserved across retry attempts.
    pub id: Uuid,
    /// Type tag used to resolve the handler.
    pub task_type: String,
    /// Opaque handler input.
    #[serde(default)]
    pub payload: Value,
    /// Higher values run first.
    #[serde(default)]
    pub priority: i32,
    /// Per-task timeout. Falls back to the agent default when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Earliest time the task may be dequeued.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// Capabilities an agent must declare to receive this task.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            priority: 0,
            timeout_ms: None,
            scheduled_at: None,
            attempts: 0,
            max_retries: 0,
            required_capabilities: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The task's own timeout, if it declares one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Whether the task is still waiting for its scheduled time.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    /// Bump the attempt counter and return the new (1-based) attempt number.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }
}

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

/// Terminal outcome of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a worker reports back once an attempt is over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Whether a caller may retry this attempt.
    pub retryable: bool,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn completed(task: &Task, agent_id: Uuid, output: Value, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            agent_id,
            status: TaskStatus::Completed,
            output: Some(output),
            error: None,
            retryable: false,
            attempt: task.attempts,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        task: &Task,
        agent_id: Uuid,
        error: impl Into<String>,
        retryable: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.id,
            agent_id,
            status: TaskStatus::Failed,
            output: None,
            error: Some(error.into()),
            retryable,
            attempt: task.attempts,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn timed_out(task: &Task, agent_id: Uuid, after: Duration, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            agent_id,
            status: TaskStatus::TimedOut,
            output: None,
            error: Some(format!("timed out after {}ms", after.as_millis())),
            retryable: true,
            attempt: task.attempts,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn cancelled(task: &Task, agent_id: Uuid, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id,
            agent_id,
            status: TaskStatus::Cancelled,
            output: None,
            error: Some(reason.into()),
            retryable: false,
            attempt: task.attempts,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn duration(&self) -> Duration {
        (self.completed_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}
