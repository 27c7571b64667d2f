//! Fixtures shared by the engine's unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use db::{Collection, DbError, DocumentRow, InMemoryRepository, Repository};
use handlers::{HandlerRegistry, TaskHandler};

use crate::agent::{Agent, AgentConfig, AgentSpec};
use crate::config::RuntimeConfig;
use crate::runtime::AgentRuntime;

pub(crate) fn registry(handlers: Vec<Arc<dyn TaskHandler>>) -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(handler).unwrap();
    }
    Arc::new(registry)
}

/// Short grace periods so stop paths finish quickly.
pub(crate) fn runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        stop_grace_period_ms: 100,
        shutdown_timeout_ms: 2_000,
        failure_threshold: 3,
        ..RuntimeConfig::default()
    }
}

pub(crate) fn agent_config(max_concurrent_tasks: usize, queue_capacity: usize) -> AgentConfig {
    AgentConfig {
        max_concurrent_tasks,
        queue_capacity,
        ..AgentConfig::default()
    }
}

pub(crate) fn runtime(handlers: Vec<Arc<dyn TaskHandler>>) -> Arc<AgentRuntime> {
    Arc::new(AgentRuntime::new(
        runtime_config(),
        AgentConfig::default(),
        registry(handlers),
    ))
}

pub(crate) async fn started_agent(runtime: &AgentRuntime, name: &str, capabilities: &[&str]) -> Arc<Agent> {
    let agent = runtime
        .create_agent(AgentSpec::new(name, "worker").with_capabilities(capabilities.iter().copied()))
        .await
        .unwrap();
    runtime.start(agent.id).await.unwrap();
    agent
}

/// Poll `check` until it holds or two seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// In-memory repository where every write takes `delay`.
pub(crate) struct SlowRepository {
    inner: InMemoryRepository,
    delay: Duration,
}

impl SlowRepository {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryRepository::new(),
            delay,
        }
    }
}

#[async_trait]
impl Repository for SlowRepository {
    async fn create(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        self.inner.create(collection, id, document).await
    }

    async fn get(&self, collection: Collection, id: Uuid) -> Result<DocumentRow, DbError> {
        self.inner.get(collection, id).await
    }

    async fn update(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        self.inner.update(collection, id, document).await
    }

    async fn delete(&self, collection: Collection, id: Uuid) -> Result<(), DbError> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(collection, id).await
    }

    async fn list(&self, collection: Collection) -> Result<Vec<DocumentRow>, DbError> {
        self.inner.list(collection).await
    }

    async fn upsert(&self, collection: Collection, id: Uuid, document: Value) -> Result<DocumentRow, DbError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(collection, id, document).await
    }
}
