//! The `TaskHandler` trait: the contract every task handler must fulfil.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::HandlerError;

/// Per-invocation context passed to a handler.
///
/// Defined here (in the handlers crate) so both the engine and individual
/// handler implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Identity of the task; stable across retry attempts.
    pub task_id: Uuid,
    /// Type tag the handler was resolved by.
    pub task_type: String,
    /// Agent whose worker is running the task.
    pub agent_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cooperative cancellation signal. Fired on timeout, on task
    /// cancellation, and when the owning agent abandons in-flight work.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Returns `true` once the task has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The core handler trait.
///
/// Handlers should check [`TaskContext::cancel`] at safe points. A handler
/// that ignores it is never force-killed; its result is simply discarded
/// once the caller has given up waiting.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task type tag this handler serves.
    fn task_type(&self) -> &str;

    /// Reject a payload before it is queued. Defaults to accepting anything.
    fn validate(&self, _payload: &Value) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Run the task and return its JSON output.
    async fn handle(&self, payload: Value, ctx: &TaskContext) -> Result<Value, HandlerError>;
}
