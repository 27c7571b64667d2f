//! Queue error type.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("task {0} not found in queue")]
    NotFound(Uuid),

    #[error("task {0} is already queued")]
    Duplicate(Uuid),

    #[error("dequeue cancelled")]
    Cancelled,

    #[error("queue is shut down")]
    Shutdown,
}
