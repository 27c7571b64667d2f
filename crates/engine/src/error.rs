//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use handlers::RegistryError;
use queue::QueueError;

use crate::agent::AgentState;

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    // ------ Agent lifecycle ------

    #[error("agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: AgentState, to: AgentState },

    #[error("agent {agent_id} is not accepting tasks (state {state})")]
    AgentNotRunning { agent_id: Uuid, state: AgentState },

    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("agent limit reached ({0})")]
    AgentLimitReached(usize),

    #[error("validation failed: {0}")]
    Validation(String),

    // ------ Workflow errors ------

    /// The graph has a cycle. The path repeats its first node at the end.
    #[error("workflow graph contains a cycle: {}", .0.join(" -> "))]
    WorkflowCyclic(Vec<String>),

    #[error("workflow validation failed: {0}")]
    WorkflowValidationFailed(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    // ------ Execution errors ------

    #[error("task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: Uuid, timeout_ms: u64 },

    #[error("node '{node_id}' exhausted {attempts} attempt(s): {message}")]
    TaskRetryExhausted {
        node_id: String,
        attempts: u32,
        message: String,
    },

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("no eligible agent for task type '{task_type}'")]
    NoEligibleAgent { task_type: String },

    #[error("scheduler is shut down")]
    SchedulerShutdown,

    // ------ Collaborators ------

    #[error("handler error: {0}")]
    Handler(#[from] RegistryError),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Whether a dispatch that failed with this error may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::AgentNotRunning { .. } | Self::NoEligibleAgent { .. }
        )
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { capacity } => Self::QueueFull { capacity },
            QueueError::NotFound(id) => Self::TaskNotFound(id),
            QueueError::Duplicate(id) => Self::Validation(format!("task {id} is already queued")),
            QueueError::Cancelled | QueueError::Shutdown => Self::SchedulerShutdown,
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
