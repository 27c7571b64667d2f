//! Workflow execution engine.
//!
//! `WorkflowEngine` runs workflows on top of the agent runtime:
//! 1. Validates the graph synchronously; invalid workflows never run.
//! 2. Walks the execution batches in order. Batch N+1 starts only once every
//!    node of batch N is terminal.
//! 3. Dispatches ready work items concurrently (bounded per batch) through
//!    the coordinator and runtime, retrying retryable failures with backoff.
//! 4. A failed node blocks its dependents only; independent branches finish.
//! 5. Persists executions on a best-effort basis and publishes progress
//!    after every batch.
//! 6. Finished executions stay in memory for `execution_retention`; a
//!    periodic sweep evicts older ones, which remain in the repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::Collection;
use queue::{Task, TaskResult, TaskStatus};

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::dag::DependencyGraph;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventPublisher, NoopPublisher, OrchestratorEvent};
use crate::metrics::Metrics;
use crate::models::{
    EdgeCondition, ExecutionStatus, ExecutionSummary, Node, NodeAttempt, NodeType, TaskState,
    Workflow, WorkflowExecution, WorkflowStatus,
};
use crate::runtime::{dropped_result, AgentRuntime};
use crate::store::Store;

const INTERRUPTED: &str = "interrupted by restart";
const CANCELLED: &str = "execution cancelled";

// ---------------------------------------------------------------------------
// Execution handle
// ---------------------------------------------------------------------------

/// Returned by [`WorkflowEngine::execute`]; the run itself is in the background.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    state: Arc<RwLock<WorkflowExecution>>,
    status: watch::Receiver<ExecutionStatus>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    pub fn snapshot(&self) -> WorkflowExecution {
        self.state.read().clone()
    }

    pub fn cancel(&self) {
        if !self.status().is_terminal() {
            self.cancel.cancel();
        }
    }

    /// Wait for a terminal status and return the final record.
    pub async fn wait(mut self) -> WorkflowExecution {
        let _ = self.status.wait_for(|s| s.is_terminal()).await;
        self.snapshot()
    }
}

struct ExecutionEntry {
    state: Arc<RwLock<WorkflowExecution>>,
    cancel: CancellationToken,
    status: watch::Receiver<ExecutionStatus>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    config: EngineConfig,
    runtime: Arc<AgentRuntime>,
    coordinator: Arc<Coordinator>,
    store: Store,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<Metrics>,
    executions: RwLock<HashMap<Uuid, ExecutionEntry>>,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    slots: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, runtime: Arc<AgentRuntime>, coordinator: Arc<Coordinator>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_executions.max(1)));
        Self {
            config,
            runtime,
            coordinator,
            store: Store::default(),
            events: Arc::new(NoopPublisher),
            metrics: Arc::new(Metrics::new()),
            executions: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            slots,
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Build and check the workflow's graph. Work items must carry a task
    /// whose type is registered and whose payload the handler accepts.
    pub fn validate(&self, workflow: &Workflow) -> Result<DependencyGraph> {
        if workflow.nodes.is_empty() {
            return Err(OrchestratorError::WorkflowValidationFailed(
                "workflow has no nodes".into(),
            ));
        }
        let graph = DependencyGraph::from_workflow(workflow)?;
        graph.validate_acyclic()?;

        for node in &workflow.nodes {
            if node.node_type != NodeType::WorkItem {
                continue;
            }
            let task = node.task.as_ref().ok_or_else(|| {
                OrchestratorError::WorkflowValidationFailed(format!(
                    "work item '{}' has no task",
                    node.id
                ))
            })?;
            self.runtime
                .handlers()
                .validate(&task.task_type, &task.payload)
                .map_err(|e| {
                    OrchestratorError::WorkflowValidationFailed(format!("node '{}': {}", node.id, e))
                })?;
        }
        Ok(graph)
    }

    // -----------------------------------------------------------------------
    // Workflow registry
    // -----------------------------------------------------------------------

    /// Validate and store a workflow, marking it `Active`.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub async fn submit_workflow(&self, mut workflow: Workflow) -> Result<Uuid> {
        self.validate(&workflow)?;
        workflow.status = WorkflowStatus::Active;
        let id = workflow.id;
        self.store.save(Collection::Workflows, id, &workflow);
        info!("registered workflow '{}' v{} ({})", workflow.name, workflow.version, id);
        self.workflows.write().insert(id, workflow);
        Ok(id)
    }

    pub fn get_workflow(&self, id: Uuid) -> Result<Workflow> {
        self.workflows
            .read()
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::WorkflowNotFound(id))
    }

    pub fn list_workflows(&self) -> Vec<Workflow> {
        let mut list: Vec<Workflow> = self.workflows.read().values().cloned().collect();
        list.sort_by_key(|w| w.created_at);
        list
    }

    pub async fn set_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<()> {
        let workflow = {
            let mut workflows = self.workflows.write();
            let workflow = workflows
                .get_mut(&id)
                .ok_or(OrchestratorError::WorkflowNotFound(id))?;
            workflow.status = status;
            workflow.clone()
        };
        self.store.save(Collection::Workflows, id, &workflow);
        Ok(())
    }

    /// Run a registered workflow. Paused workflows are refused.
    pub async fn execute_by_id(self: &Arc<Self>, id: Uuid) -> Result<ExecutionHandle> {
        let workflow = self.get_workflow(id)?;
        if workflow.status == WorkflowStatus::Paused {
            return Err(OrchestratorError::Validation(format!("workflow {id} is paused")));
        }
        self.execute(workflow).await
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Validate `workflow` and start running it in the background.
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub async fn execute(self: &Arc<Self>, workflow: Workflow) -> Result<ExecutionHandle> {
        let graph = self.validate(&workflow)?;
        let orphans = graph.orphans();
        if !orphans.is_empty() {
            warn!(
                "workflow '{}' has nodes unreachable from start: {:?}",
                workflow.name, orphans
            );
        }

        let execution = WorkflowExecution::new(&workflow);
        let execution_id = execution.id;
        self.store.save(Collection::Executions, execution_id, &execution);

        let state = Arc::new(RwLock::new(execution));
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Pending);
        self.executions.write().insert(
            execution_id,
            ExecutionEntry {
                state: Arc::clone(&state),
                cancel: cancel.clone(),
                status: status_rx.clone(),
            },
        );

        let handle = ExecutionHandle {
            execution_id,
            workflow_id: workflow.id,
            state: Arc::clone(&state),
            status: status_rx,
            cancel: cancel.clone(),
        };
        info!(
            "execution {} of workflow '{}' accepted ({} nodes)",
            execution_id,
            workflow.name,
            workflow.nodes.len()
        );

        let run = Run {
            engine: Arc::clone(self),
            workflow,
            graph,
            state,
            cancel,
            status: status_tx,
            interrupted: AtomicBool::new(false),
        };
        tokio::spawn(run.drive());
        Ok(handle)
    }

    /// Cancel a running execution. Cancelling a terminal one is a no-op.
    #[instrument(skip(self))]
    pub fn cancel(&self, execution_id: Uuid) -> Result<()> {
        let executions = self.executions.read();
        let entry = executions
            .get(&execution_id)
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))?;
        if entry.status.borrow().is_terminal() {
            debug!("execution {} already terminal; ignoring cancel", execution_id);
            return Ok(());
        }
        entry.cancel.cancel();
        info!("cancellation requested for execution {}", execution_id);
        Ok(())
    }

    /// Cancel every non-terminal execution; returns how many were asked.
    pub fn cancel_all(&self) -> usize {
        let executions = self.executions.read();
        let mut cancelled = 0;
        for entry in executions.values() {
            if !entry.status.borrow().is_terminal() && !entry.cancel.is_cancelled() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Wait until every execution started so far is terminal.
    pub async fn wait_idle(&self) {
        let receivers: Vec<watch::Receiver<ExecutionStatus>> = self
            .executions
            .read()
            .values()
            .map(|e| e.status.clone())
            .collect();
        for mut status in receivers {
            let _ = status.wait_for(|s| s.is_terminal()).await;
        }
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        self.executions
            .read()
            .get(&execution_id)
            .map(|e| e.state.read().clone())
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))
    }

    /// Every known execution, oldest first.
    pub fn list_executions(&self) -> Vec<WorkflowExecution> {
        let mut list: Vec<WorkflowExecution> = self
            .executions
            .read()
            .values()
            .map(|e| e.state.read().clone())
            .collect();
        list.sort_by_key(|e| e.created_at);
        list
    }

    pub fn execution_summary(&self, execution_id: Uuid) -> Result<ExecutionSummary> {
        self.executions
            .read()
            .get(&execution_id)
            .map(|e| e.state.read().summary())
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))
    }

    /// Look an execution up in memory, then in the repository. Evicted
    /// executions are only found by the latter.
    pub async fn load_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution> {
        if let Ok(execution) = self.get_execution(execution_id) {
            return Ok(execution);
        }
        self.store
            .load(Collection::Executions, execution_id)
            .await
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))
    }

    /// Forget finished executions that completed more than `retention` ago.
    /// Returns how many were evicted.
    pub fn evict_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };
        let mut executions = self.executions.write();
        let before = executions.len();
        executions.retain(|_, entry| {
            let exec = entry.state.read();
            !(exec.status.is_terminal() && exec.completed_at.is_some_and(|at| at < cutoff))
        });
        let evicted = before - executions.len();
        if evicted > 0 {
            debug!("evicted {} finished execution(s) from memory", evicted);
        }
        evicted
    }

    /// Run [`evict_finished`](Self::evict_finished) every
    /// `retention_sweep_interval` until the engine is dropped.
    pub fn spawn_retention_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.retention_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let evicted = engine.evict_finished(engine.config.execution_retention());
                if evicted > 0 {
                    info!("retention sweep dropped {} execution(s)", evicted);
                }
            }
            debug!("retention sweeper stopped");
        })
    }

    /// Reload workflows and executions. Executions that were still running
    /// when the previous process died are marked failed.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> usize {
        let workflows: Vec<Workflow> = self.store.load_all(Collection::Workflows).await;
        {
            let mut map = self.workflows.write();
            for workflow in workflows {
                map.entry(workflow.id).or_insert(workflow);
            }
        }

        let executions: Vec<WorkflowExecution> = self.store.load_all(Collection::Executions).await;
        let mut interrupted = 0;
        for mut execution in executions {
            if self.executions.read().contains_key(&execution.id) {
                continue;
            }
            if !execution.status.is_terminal() {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(INTERRUPTED.into());
                execution.completed_at = Some(Utc::now());
                for record in execution.nodes.iter_mut().filter(|r| !r.state.is_terminal()) {
                    record.finish(TaskState::Failed, Some(INTERRUPTED.into()));
                }
                self.store.save(Collection::Executions, execution.id, &execution);
                warn!("execution {} {}", execution.id, INTERRUPTED);
                interrupted += 1;
            }

            let (_, status) = watch::channel(execution.status);
            self.executions.write().insert(
                execution.id,
                ExecutionEntry {
                    state: Arc::new(RwLock::new(execution)),
                    cancel: CancellationToken::new(),
                    status,
                },
            );
        }
        info!("recovered executions; {} marked as interrupted", interrupted);
        interrupted
    }
}

// ---------------------------------------------------------------------------
// A single run
// ---------------------------------------------------------------------------

enum Readiness {
    Ready,
    Skip(String),
    Blocked(String),
}

enum Outcome {
    Succeeded(Value),
    Retry(String),
    Fatal(String),
    Cancelled(String),
}

struct Run {
    engine: Arc<WorkflowEngine>,
    workflow: Workflow,
    graph: DependencyGraph,
    state: Arc<RwLock<WorkflowExecution>>,
    cancel: CancellationToken,
    status: watch::Sender<ExecutionStatus>,
    /// Set once cancellation actually stopped or skipped some work.
    interrupted: AtomicBool,
}

impl Run {
    fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    fn execution_id(&self) -> Uuid {
        self.state.read().id
    }

    async fn drive(self) {
        let engine = Arc::clone(&self.engine);
        let permit = tokio::select! {
            permit = Arc::clone(&engine.slots).acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        };
        let Some(_permit) = permit else {
            self.finalize();
            return;
        };

        engine.metrics.execution_started();
        {
            let mut exec = self.state.write();
            exec.status = ExecutionStatus::Running;
            exec.started_at = Some(Utc::now());
        }
        self.publish_status(ExecutionStatus::Running);
        self.persist();

        let batches = self.graph.execution_batches();
        for (i, batch) in batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.mark_interrupted();
                break;
            }
            debug!(
                "execution {} batch {}/{}: {:?}",
                self.execution_id(),
                i + 1,
                batches.len(),
                batch
            );
            self.run_batch(batch).await;
            self.persist();
            self.publish_progress();
        }

        self.finalize();
        engine.metrics.execution_finished();
    }

    async fn run_batch(&self, batch: &[String]) {
        let limit = Arc::new(Semaphore::new(
            self.engine.config.max_concurrent_tasks_per_batch.max(1),
        ));
        let mut running = FuturesUnordered::new();

        for node_id in batch {
            let Some(node) = self.workflow.node(node_id) else {
                continue;
            };
            match self.readiness(node_id) {
                Readiness::Skip(reason) => {
                    debug!("node '{}' skipped: {}", node_id, reason);
                    self.set_node_state(node_id, TaskState::Skipped, Some(reason));
                }
                Readiness::Blocked(reason) => {
                    warn!("node '{}' blocked: {}", node_id, reason);
                    self.set_node_state(node_id, TaskState::Cancelled, Some(reason));
                }
                Readiness::Ready if node.node_type.is_structural() => {
                    self.set_node_state(node_id, TaskState::Succeeded, None);
                }
                Readiness::Ready => {
                    let limit = Arc::clone(&limit);
                    running.push(async move {
                        let _permit = limit.acquire_owned().await;
                        self.run_node(node).await;
                    });
                }
            }
        }

        while running.next().await.is_some() {}
    }

    /// Decide whether `node_id` may run given its predecessors' states.
    /// A blocking predecessor wins over a skipping one.
    fn readiness(&self, node_id: &str) -> Readiness {
        let exec = self.state.read();
        let mut skip = None;

        for (pred, condition) in self.graph.incoming_edges(node_id) {
            let state = exec.node_state(pred);
            match (condition, state) {
                (EdgeCondition::ContinueOnFailure, s) if s.is_terminal() => {}
                (_, TaskState::Skipped) => {
                    skip.get_or_insert_with(|| format!("predecessor '{pred}' was skipped"));
                }
                (EdgeCondition::OnSuccess, TaskState::Succeeded) => {}
                (EdgeCondition::VariableEquals { variable, equals }, TaskState::Succeeded) => {
                    if exec.lookup(variable) != Some(equals) {
                        skip.get_or_insert_with(|| format!("condition {variable} == {equals} not met"));
                    }
                }
                (_, state) => {
                    return Readiness::Blocked(format!("predecessor '{pred}' is {state}"));
                }
            }
        }

        match skip {
            Some(reason) => Readiness::Skip(reason),
            None => Readiness::Ready,
        }
    }

    #[instrument(skip(self, node), fields(node_id = %node.id))]
    async fn run_node(&self, node: &Node) {
        let Some(template) = node.task.as_ref() else {
            self.set_node_state(&node.id, TaskState::Failed, Some("work item has no task".into()));
            return;
        };
        let max_retries = template.max_retries.unwrap_or(self.engine.config.max_retries);
        let mut task = template
            .to_task(Uuid::new_v4())
            .with_max_retries(max_retries)
            .with_metadata("execution_id", json!(self.execution_id()))
            .with_metadata("node_id", json!(node.id));

        self.set_node_state(&node.id, TaskState::Running, None);

        let mut attempt = 0;
        loop {
            attempt += 1;
            task.attempts = attempt;

            let (record, outcome) = self.attempt(&task).await;
            self.record_attempt(&node.id, record);

            let message = match outcome {
                Outcome::Succeeded(output) => {
                    {
                        let mut exec = self.state.write();
                        exec.context.insert(node.id.clone(), output.clone());
                        if let Some(rec) = exec.node_mut(&node.id) {
                            rec.output = Some(output);
                        }
                    }
                    info!("node '{}' succeeded on attempt {}", node.id, attempt);
                    self.set_node_state(&node.id, TaskState::Succeeded, None);
                    return;
                }
                Outcome::Cancelled(reason) => {
                    self.mark_interrupted();
                    self.set_node_state(&node.id, TaskState::Cancelled, Some(reason));
                    return;
                }
                Outcome::Fatal(message) => {
                    error!("node '{}' failed: {}", node.id, message);
                    self.set_node_state(&node.id, TaskState::Failed, Some(message));
                    return;
                }
                Outcome::Retry(message) => message,
            };

            if attempt > max_retries {
                let exhausted = OrchestratorError::TaskRetryExhausted {
                    node_id: node.id.clone(),
                    attempts: attempt,
                    message,
                };
                error!("{}", exhausted);
                self.set_node_state(&node.id, TaskState::Failed, Some(exhausted.to_string()));
                return;
            }

            let delay = self.engine.config.retry_delay(attempt);
            warn!(
                "node '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                node.id,
                attempt,
                max_retries + 1,
                delay,
                message
            );
            {
                let mut exec = self.state.write();
                if let Some(rec) = exec.node_mut(&node.id) {
                    rec.error = Some(message);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.mark_interrupted();
                    self.set_node_state(&node.id, TaskState::Cancelled, Some(CANCELLED.into()));
                    return;
                }
            }
        }
    }

    /// One dispatch of `task`: pick an agent, submit, wait for the result.
    async fn attempt(&self, task: &Task) -> (NodeAttempt, Outcome) {
        let started_at = Utc::now();
        let unassigned = |error: String| NodeAttempt {
            attempt: task.attempts,
            agent_id: None,
            status: TaskStatus::Failed,
            error: Some(error),
            started_at,
            completed_at: Utc::now(),
        };

        if self.cancel.is_cancelled() {
            let reason = CANCELLED.to_string();
            let mut record = unassigned(reason.clone());
            record.status = TaskStatus::Cancelled;
            return (record, Outcome::Cancelled(reason));
        }

        let candidates = self.engine.runtime.running_agents();
        let agent = match self.engine.coordinator.select_agent(task, &candidates) {
            Ok(agent) => agent,
            Err(e) => return (unassigned(e.to_string()), Outcome::Retry(e.to_string())),
        };
        let mut handle = match self.engine.runtime.submit_task(agent.id, task.clone()) {
            Ok(handle) => handle,
            Err(e) if e.is_transient() => return (unassigned(e.to_string()), Outcome::Retry(e.to_string())),
            Err(e) => return (unassigned(e.to_string()), Outcome::Fatal(e.to_string())),
        };

        let result = tokio::select! {
            result = &mut handle.result => result.ok(),
            _ = self.cancel.cancelled() => {
                handle.cancel();
                tokio::time::timeout(self.engine.config.cancel_grace_period(), &mut handle.result)
                    .await
                    .ok()
                    .and_then(|r| r.ok())
            }
        };
        let result: TaskResult =
            result.unwrap_or_else(|| dropped_result(task.id, agent.id, task.attempts));

        let record = NodeAttempt {
            attempt: result.attempt,
            agent_id: Some(result.agent_id),
            status: result.status,
            error: result.error.clone(),
            started_at: result.started_at,
            completed_at: result.completed_at,
        };
        let error = result.error.unwrap_or_else(|| result.status.to_string());
        let outcome = match result.status {
            TaskStatus::Completed => Outcome::Succeeded(result.output.unwrap_or(Value::Null)),
            TaskStatus::Cancelled if self.cancel.is_cancelled() => Outcome::Cancelled(error),
            // The agent went away under the task; try elsewhere.
            TaskStatus::Cancelled => Outcome::Retry(error),
            _ if result.retryable => Outcome::Retry(error),
            _ => Outcome::Fatal(error),
        };
        (record, outcome)
    }

    fn record_attempt(&self, node_id: &str, record: NodeAttempt) {
        let mut exec = self.state.write();
        if let Some(rec) = exec.node_mut(node_id) {
            if record.agent_id.is_some() {
                rec.agent_id = record.agent_id;
            }
            rec.attempts.push(record);
        }
    }

    fn set_node_state(&self, node_id: &str, state: TaskState, error: Option<String>) {
        let execution_id = {
            let mut exec = self.state.write();
            if let Some(rec) = exec.node_mut(node_id) {
                if state == TaskState::Running {
                    rec.state = state;
                    rec.started_at = Some(Utc::now());
                } else {
                    rec.finish(state, error);
                }
            }
            exec.id
        };
        self.engine.events.publish(OrchestratorEvent::NodeStateChanged {
            execution_id,
            node_id: node_id.to_owned(),
            state,
        });
    }

    /// A cancel that lands after the last node finished does not relabel
    /// the run.
    fn finalize(&self) {
        let (status, execution_id) = {
            let mut exec = self.state.write();
            if self.cancel.is_cancelled() {
                for rec in exec.nodes.iter_mut().filter(|r| !r.state.is_terminal()) {
                    rec.finish(TaskState::Cancelled, Some(CANCELLED.into()));
                    self.mark_interrupted();
                }
            }
            let cancelled = self.interrupted.load(Ordering::Relaxed);
            let failed: Vec<String> = exec
                .nodes
                .iter()
                .filter(|r| matches!(r.state, TaskState::Failed | TaskState::Cancelled))
                .map(|r| r.node_id.clone())
                .collect();

            let status = if cancelled {
                exec.error = Some(CANCELLED.into());
                ExecutionStatus::Cancelled
            } else if !failed.is_empty() {
                exec.error = Some(format!("nodes did not succeed: {}", failed.join(", ")));
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            };
            exec.status = status;
            exec.completed_at = Some(Utc::now());
            (status, exec.id)
        };

        match status {
            ExecutionStatus::Completed => info!("execution {} completed", execution_id),
            other => warn!("execution {} finished as {}", execution_id, other),
        }
        self.persist();

        let workflow_status = match status {
            ExecutionStatus::Completed => Some(WorkflowStatus::Completed),
            ExecutionStatus::Failed => Some(WorkflowStatus::Failed),
            _ => None,
        };
        if let Some(workflow_status) = workflow_status {
            let updated = {
                let mut workflows = self.engine.workflows.write();
                workflows.get_mut(&self.workflow.id).map(|w| {
                    w.status = workflow_status;
                    w.clone()
                })
            };
            if let Some(workflow) = updated {
                self.engine.store.save(Collection::Workflows, workflow.id, &workflow);
            }
        }

        self.publish_status(status);
    }

    fn publish_status(&self, status: ExecutionStatus) {
        self.status.send_replace(status);
        self.engine.events.publish(OrchestratorEvent::ExecutionStatusChanged {
            execution_id: self.execution_id(),
            workflow_id: self.workflow.id,
            status,
        });
    }

    fn publish_progress(&self) {
        let (execution_id, progress) = {
            let exec = self.state.read();
            (exec.id, exec.progress())
        };
        self.engine
            .events
            .publish(OrchestratorEvent::ExecutionProgress { execution_id, progress });
    }

    fn persist(&self) {
        let snapshot = self.state.read().clone();
        self.engine.store.save(Collection::Executions, snapshot.id, &snapshot);
    }
}
