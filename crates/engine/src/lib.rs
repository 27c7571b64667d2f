//! `engine` crate: agent runtime, coordinator, dependency graph, workflow
//! engine and task scheduler.

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod dag;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use agent::{Agent, AgentConfig, AgentHealth, AgentSnapshot, AgentSpec, AgentState};
pub use config::{CoordinatorConfig, EngineConfig, OrchestratorConfig, QueueConfig, RuntimeConfig, StrategyKind};
pub use coordinator::{Coordinator, SelectionStrategy};
pub use dag::{DependencyGraph, ExecutionPlan, GraphStats};
pub use error::{OrchestratorError, Result};
pub use events::{ChannelPublisher, EventPublisher, NoopPublisher, OrchestratorEvent, TracingPublisher};
pub use executor::{ExecutionHandle, WorkflowEngine};
pub use store::Store;
pub use health::{HealthProvider, StaticHealthProvider};
pub use metrics::{Metrics, MetricsSnapshot};
pub use models::{
    Edge, EdgeCondition, ExecutionStatus, Node, NodeTask, NodeType, TaskState, Workflow,
    WorkflowExecution, WorkflowStatus,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RecoveryReport};
pub use runtime::{AgentRuntime, TaskHandle};
pub use scheduler::{TaskScheduler, TaskTicket};

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod executor_tests;
#[cfg(test)]
mod scheduler_tests;
