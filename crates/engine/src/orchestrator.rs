//! Top-level wiring: one runtime, coordinator, workflow engine and scheduler
//! sharing a store, an event publisher and a set of counters.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use db::Repository;
use handlers::HandlerRegistry;

use crate::config::OrchestratorConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::events::{EventPublisher, TracingPublisher};
use crate::executor::WorkflowEngine;
use crate::health::HealthProvider;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::runtime::AgentRuntime;
use crate::scheduler::TaskScheduler;
use crate::store::Store;

#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    handlers: Option<Arc<HandlerRegistry>>,
    repository: Option<Arc<dyn Repository>>,
    events: Option<Arc<dyn EventPublisher>>,
    health: Option<Arc<dyn HealthProvider>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Defaults to an in-memory repository.
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Defaults to logging every event through `tracing`.
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Polled every `runtime.health_poll_interval_ms` once started.
    pub fn health_provider(mut self, provider: Arc<dyn HealthProvider>) -> Self {
        self.health = Some(provider);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let handlers = self
            .handlers
            .unwrap_or_else(|| Arc::new(HandlerRegistry::new()));
        let store = self.repository.map(Store::new).unwrap_or_default();
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(TracingPublisher) as Arc<dyn EventPublisher>);
        let metrics = Arc::new(Metrics::new());

        let runtime = Arc::new(
            AgentRuntime::new(config.runtime.clone(), config.agent.clone(), handlers)
                .with_events(Arc::clone(&events))
                .with_store(store.clone())
                .with_metrics(Arc::clone(&metrics)),
        );
        let coordinator = Arc::new(Coordinator::from_config(&config.coordinator));
        let engine = Arc::new(
            WorkflowEngine::new(config.engine.clone(), Arc::clone(&runtime), Arc::clone(&coordinator))
                .with_store(store.clone())
                .with_events(events)
                .with_metrics(metrics),
        );
        let scheduler = Arc::new(
            TaskScheduler::new(
                config.queue.clone(),
                config.engine.clone(),
                Arc::clone(&runtime),
                Arc::clone(&coordinator),
            )
            .with_store(store),
        );

        info!("orchestrator built (selection: {})", coordinator.strategy_name());
        Ok(Orchestrator {
            config,
            runtime,
            coordinator,
            engine,
            scheduler,
            health: self.health,
            background: Mutex::new(Vec::new()),
        })
    }
}

/// What `recover` brought back from the repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub agents: usize,
    pub interrupted_executions: usize,
    pub requeued_tasks: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    runtime: Arc<AgentRuntime>,
    coordinator: Arc<Coordinator>,
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<TaskScheduler>,
    health: Option<Arc<dyn HealthProvider>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Start the scheduler loops, the execution retention sweep and, when
    /// configured, the health poller.
    pub fn start(&self) {
        self.scheduler.start();
        self.background.lock().push(self.engine.spawn_retention_sweeper());
        if let (Some(provider), Some(ms)) = (&self.health, self.config.runtime.health_poll_interval_ms) {
            let poller = self
                .runtime
                .spawn_health_poller(Arc::clone(provider), Duration::from_millis(ms));
            self.background.lock().push(poller);
        }
    }

    /// Reload agents, workflows, executions and queued tasks.
    pub async fn recover(&self) -> RecoveryReport {
        let report = RecoveryReport {
            agents: self.runtime.recover().await,
            interrupted_executions: self.engine.recover().await,
            requeued_tasks: self.scheduler.recover().await,
        };
        info!(
            "recovery: {} agent(s), {} interrupted execution(s), {} re-queued task(s)",
            report.agents, report.interrupted_executions, report.requeued_tasks
        );
        report
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.runtime.metrics();
        self.scheduler.fill_metrics(&mut snapshot);
        snapshot
    }

    /// Cancel running executions, stop the scheduler, then stop every agent.
    pub async fn shutdown(&self) {
        let cancelled = self.engine.cancel_all();
        if cancelled > 0 {
            info!("cancelling {} running execution(s)", cancelled);
        }
        self.scheduler.shutdown().await;
        let _ = tokio::time::timeout(self.config.runtime.shutdown_timeout(), self.engine.wait_idle()).await;
        self.runtime.shutdown().await;
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        info!("orchestrator shut down");
    }
}
