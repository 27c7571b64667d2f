//! `MockHandler`: a test double for `TaskHandler`.
//!
//! Useful in unit and integration tests where a real handler implementation
//! is either unavailable or irrelevant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::{HandlerError, TaskContext, TaskHandler};

/// Behaviour injected into `MockHandler` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `n` calls, then succeed.
    FailTimes(u32, Value),
    /// Sleep, returning early with `Cancelled` if the token fires.
    Sleep(Duration),
    /// Sleep and ignore the cancellation token entirely.
    SleepIgnoringCancel(Duration),
    /// Panic inside the handler.
    Panic(String),
}

/// A mock handler that records every call it receives and returns a
/// programmer-specified result.
pub struct MockHandler {
    /// Type tag this mock registers under.
    pub task_type: String,
    /// What the handler will do when `handle` is called.
    pub behaviour: MockBehaviour,
    /// All payloads seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    /// Calls that observed cancellation.
    cancelled: AtomicU32,
}

impl MockHandler {
    fn with_behaviour(task_type: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            task_type: task_type.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            cancelled: AtomicU32::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(task_type: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(task_type, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(task_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(task_type, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(task_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(task_type, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before returning `value`.
    pub fn flaky(task_type: impl Into<String>, failures: u32, value: Value) -> Self {
        Self::with_behaviour(task_type, MockBehaviour::FailTimes(failures, value))
    }

    /// Create a mock that sleeps for `duration`, honouring cancellation.
    pub fn sleeping(task_type: impl Into<String>, duration: Duration) -> Self {
        Self::with_behaviour(task_type, MockBehaviour::Sleep(duration))
    }

    /// Create a mock that sleeps for `duration` and never checks for cancellation.
    pub fn stubborn(task_type: impl Into<String>, duration: Duration) -> Self {
        Self::with_behaviour(task_type, MockBehaviour::SleepIgnoringCancel(duration))
    }

    /// Create a mock that panics on every call.
    pub fn panicking(task_type: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(task_type, MockBehaviour::Panic(msg.into()))
    }

    /// Number of times this handler has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of invocations that returned because of cancellation.
    pub fn cancelled_count(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for MockHandler {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn handle(&self, payload: Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
        let call_number = {
            let mut calls = self.calls.lock();
            calls.push(payload.clone());
            calls.len() as u32
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => {
                // Merge the handler's own output fields over a trace header so
                // tests can see which task and attempt produced the value.
                let mut out = json!({ "task_type": self.task_type, "attempt": ctx.attempt });
                if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
                    for (k, val) in v_obj {
                        out_obj.insert(k.clone(), val.clone());
                    }
                }
                Ok(out)
            }
            MockBehaviour::FailRetryable(msg) => Err(HandlerError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(HandlerError::Fatal(msg.clone())),
            MockBehaviour::FailTimes(n, v) => {
                if call_number <= *n {
                    Err(HandlerError::Retryable(format!("planned failure {call_number}/{n}")))
                } else {
                    Ok(v.clone())
                }
            }
            MockBehaviour::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(json!({ "slept_ms": duration.as_millis() as u64 })),
                    _ = ctx.cancel.cancelled() => {
                        self.cancelled.fetch_add(1, Ordering::SeqCst);
                        Err(HandlerError::Cancelled)
                    }
                }
            }
            MockBehaviour::SleepIgnoringCancel(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(json!({ "slept_ms": duration.as_millis() as u64 }))
            }
            MockBehaviour::Panic(msg) => panic!("{}", msg),
        }
    }
}
