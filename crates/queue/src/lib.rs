//! `queue` crate: task model and the global priority queue.
//!
//! Producers `enqueue` tasks; the dispatch loop `dequeue`s them in
//! `(priority desc, insertion order)` and hands them to agents.

pub mod error;
pub mod heap;
pub mod priority;
pub mod task;

pub use error::QueueError;
pub use priority::TaskQueue;
pub use task::{Task, TaskResult, TaskStatus};
