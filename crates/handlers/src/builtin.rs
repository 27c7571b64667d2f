//! Built-in handlers shipped with the orchestrator.
//!
//! - `echo`: returns its payload unchanged.
//! - `delay`: sleeps for `{"millis": n}` and honours cancellation.
//! - `fail`: fails with `{"message": "...", "fatal": bool}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{HandlerError, HandlerRegistry, RegistryError, TaskContext, TaskHandler};

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn handle(&self, payload: Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
        debug!("echo task {} attempt {}", ctx.task_id, ctx.attempt);
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DelayPayload {
    millis: u64,
}

/// Sleeps for the requested number of milliseconds.
pub struct DelayHandler;

impl DelayHandler {
    fn parse(payload: &Value) -> Result<DelayPayload, HandlerError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::Fatal(format!("delay payload: {e}")))
    }
}

#[async_trait]
impl TaskHandler for DelayHandler {
    fn task_type(&self) -> &str {
        "delay"
    }

    fn validate(&self, payload: &Value) -> Result<(), HandlerError> {
        Self::parse(payload).map(|_| ())
    }

    async fn handle(&self, payload: Value, ctx: &TaskContext) -> Result<Value, HandlerError> {
        let DelayPayload { millis } = Self::parse(&payload)?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(json!({ "slept_ms": millis })),
            _ = ctx.cancel.cancelled() => Err(HandlerError::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// fail
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FailPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    fatal: bool,
}

/// Always fails. Handy for exercising retry and failure propagation.
pub struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    fn task_type(&self) -> &str {
        "fail"
    }

    async fn handle(&self, payload: Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
        let spec: FailPayload = serde_json::from_value(payload).unwrap_or_default();
        let message = spec.message.unwrap_or_else(|| "requested failure".to_owned());
        if spec.fatal {
            Err(HandlerError::Fatal(message))
        } else {
            Err(HandlerError::Retryable(message))
        }
    }
}

/// Register `echo`, `delay` and `fail` on the given registry.
pub fn register_builtins(registry: &HandlerRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(EchoHandler))?;
    registry.register(Arc::new(DelayHandler))?;
    registry.register(Arc::new(FailHandler))?;
    Ok(())
}
