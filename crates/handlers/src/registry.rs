//! Type tag → handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::{RegistryError, TaskHandler};

/// Maps task type tags to shared [`TaskHandler`] implementations.
///
/// New task types can be registered while workers are running; lookups take
/// a read lock only for the duration of the map access.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own [`TaskHandler::task_type`].
    ///
    /// # Errors
    /// [`RegistryError::Duplicate`] if the type tag is already taken.
    pub fn register(&self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let task_type = handler.task_type().to_owned();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&task_type) {
            return Err(RegistryError::Duplicate(task_type));
        }
        debug!("registered handler for task type '{}'", task_type);
        handlers.insert(task_type, handler);
        Ok(())
    }

    /// Builder-style registration, for wiring a registry up front.
    pub fn with(self, handler: Arc<dyn TaskHandler>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    /// Look up the handler for a task type.
    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>, RegistryError> {
        self.handlers
            .read()
            .get(task_type)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown(task_type.to_owned()))
    }

    /// Resolve the handler and let it vet the payload.
    pub fn validate(&self, task_type: &str, payload: &Value) -> Result<(), RegistryError> {
        let handler = self.get(task_type)?;
        handler
            .validate(payload)
            .map_err(|e| RegistryError::InvalidPayload {
                task_type: task_type.to_owned(),
                reason: e.to_string(),
            })
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    /// Registered type tags, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}
