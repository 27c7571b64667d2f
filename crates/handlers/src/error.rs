//! Handler-level error types.

use thiserror::Error;

/// Errors returned by a handler's `handle` method.
///
/// The caller uses the variant to decide retry behaviour:
/// - `Retryable`: the attempt is recorded as failed and may be retried with back-off.
/// - `Fatal`: the attempt fails and no retry is attempted.
/// - `Cancelled`: the handler observed its cancellation token and stopped early.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; the task may be re-tried.
    #[error("retryable handler error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal handler error: {0}")]
    Fatal(String),

    /// The handler honoured a cancellation request.
    #[error("handler cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Whether a failed attempt with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Errors produced while registering or resolving handlers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler for this task type is already registered.
    #[error("a handler for task type '{0}' is already registered")]
    Duplicate(String),

    /// No handler is registered for this task type.
    #[error("no handler registered for task type '{0}'")]
    Unknown(String),

    /// The handler rejected the task payload up front.
    #[error("invalid payload for task type '{task_type}': {reason}")]
    InvalidPayload { task_type: String, reason: String },
}
