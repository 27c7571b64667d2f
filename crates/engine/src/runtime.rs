//! `AgentRuntime`: owns every agent and its dedicated worker.
//!
//! Each started agent gets one worker task that pulls assignments FIFO from
//! a bounded private queue and runs them through the handler registry:
//!
//! 1. `submit_task` never blocks; a full private queue is `QueueFull`.
//! 2. Pause stops dequeuing; in-flight tasks keep running.
//! 3. Stop stops dequeuing, drains in-flight tasks for the grace period,
//!    then abandons them. Queued assignments are answered `Cancelled`.
//! 4. Handlers run in their own spawned task, so a panic becomes a failed
//!    result instead of taking the worker down.
//!
//! Neither the registry lock nor an agent's lock is held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::Collection;
use handlers::{HandlerError, HandlerRegistry, TaskContext, TaskHandler};
use queue::{Task, TaskResult, TaskStatus};

use crate::agent::{Agent, AgentConfig, AgentHealth, AgentSnapshot, AgentSpec, AgentState};
use crate::config::RuntimeConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventPublisher, NoopPublisher, OrchestratorEvent};
use crate::health::HealthProvider;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::store::Store;

/// Extra time a stopping worker gets beyond its drain grace period.
const WORKER_EXIT_SLACK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Returned by [`AgentRuntime::submit_task`].
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub attempt: u32,
    /// Resolves with the task's result once the worker is done with it.
    pub result: oneshot::Receiver<TaskResult>,
    cancel: CancellationToken,
}

impl TaskHandle {
    /// Ask the worker to stop this task. A no-op once it has finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the result. A worker that vanished without answering reads
    /// as a cancelled attempt.
    pub async fn wait(self) -> TaskResult {
        let Self {
            task_id,
            agent_id,
            attempt,
            result,
            ..
        } = self;
        result
            .await
            .unwrap_or_else(|_| dropped_result(task_id, agent_id, attempt))
    }
}

pub(crate) fn dropped_result(task_id: Uuid, agent_id: Uuid, attempt: u32) -> TaskResult {
    let now = Utc::now();
    TaskResult {
        task_id,
        agent_id,
        status: TaskStatus::Cancelled,
        output: None,
        error: Some("worker dropped the task without a result".into()),
        retryable: true,
        attempt,
        started_at: now,
        completed_at: now,
    }
}

// ---------------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------------

struct Assignment {
    task: Task,
    cancel: CancellationToken,
    reply: oneshot::Sender<TaskResult>,
}

struct WorkerHandle {
    sender: mpsc::Sender<Assignment>,
    stop: CancellationToken,
    paused: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    async fn shutdown(self, agent_id: Uuid, deadline: Duration) {
        self.stop.cancel();
        let mut join = self.join;
        if tokio::time::timeout(deadline, &mut join).await.is_err() {
            warn!("worker for agent {} did not exit within {:?}; aborting it", agent_id, deadline);
            join.abort();
        }
    }
}

struct AgentEntry {
    agent: Arc<Agent>,
    worker: Option<WorkerHandle>,
}

#[derive(Clone)]
struct WorkerContext {
    agent: Arc<Agent>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<Metrics>,
    store: Store,
    grace: Duration,
    failure_threshold: u32,
    /// Stops dequeuing. Fired by `stop` or by the worker itself on failure.
    stop: CancellationToken,
    /// Fired once the drain grace period is over.
    abandon: CancellationToken,
}

// ---------------------------------------------------------------------------
// AgentRuntime
// ---------------------------------------------------------------------------

pub struct AgentRuntime {
    config: RuntimeConfig,
    agent_defaults: AgentConfig,
    handlers: Arc<HandlerRegistry>,
    agents: RwLock<HashMap<Uuid, AgentEntry>>,
    events: Arc<dyn EventPublisher>,
    store: Store,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(config: RuntimeConfig, agent_defaults: AgentConfig, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            config,
            agent_defaults,
            handlers,
            agents: RwLock::new(HashMap::new()),
            events: Arc::new(NoopPublisher),
            store: Store::default(),
            metrics: Arc::new(Metrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = store;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Register a new agent in the `Created` state.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn create_agent(&self, spec: AgentSpec) -> Result<Arc<Agent>> {
        spec.validate()?;
        let agent = Arc::new(Agent::new(spec, &self.agent_defaults));
        {
            let mut agents = self.agents.write();
            if agents.len() >= self.config.max_agents {
                return Err(OrchestratorError::AgentLimitReached(self.config.max_agents));
            }
            agents.insert(
                agent.id,
                AgentEntry {
                    agent: Arc::clone(&agent),
                    worker: None,
                },
            );
        }
        info!(
            "created agent {} ('{}', type '{}')",
            agent.id, agent.name, agent.agent_type
        );
        self.store.save(Collection::Agents, agent.id, &agent.snapshot());
        Ok(agent)
    }

    /// Live handle on an agent.
    pub fn agent(&self, id: Uuid) -> Result<Arc<Agent>> {
        self.agents
            .read()
            .get(&id)
            .map(|e| Arc::clone(&e.agent))
            .ok_or(OrchestratorError::AgentNotFound(id))
    }

    pub fn get_agent(&self, id: Uuid) -> Result<AgentSnapshot> {
        self.agent(id).map(|a| a.snapshot())
    }

    /// Every agent, sorted by id.
    pub fn list_agents(&self) -> Vec<AgentSnapshot> {
        let mut list: Vec<AgentSnapshot> = self
            .agents
            .read()
            .values()
            .map(|e| e.agent.snapshot())
            .collect();
        list.sort_by_key(|a| a.id);
        list
    }

    /// Agents currently in `Running`, sorted by id.
    pub fn running_agents(&self) -> Vec<Arc<Agent>> {
        let mut list: Vec<Arc<Agent>> = self
            .agents
            .read()
            .values()
            .filter(|e| e.agent.state() == AgentState::Running && !e.agent.is_stopping())
            .map(|e| Arc::clone(&e.agent))
            .collect();
        list.sort_by_key(|a| a.id);
        list
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// `Created`/`Stopped` -> `Running`. Spawns the agent's worker.
    #[instrument(skip(self))]
    pub async fn start(&self, id: Uuid) -> Result<()> {
        let (agent, from) = {
            let mut agents = self.agents.write();
            let entry = agents.get_mut(&id).ok_or(OrchestratorError::AgentNotFound(id))?;
            let from = entry.agent.state();
            if from == AgentState::Failed {
                return Err(OrchestratorError::InvalidStateTransition {
                    from,
                    to: AgentState::Running,
                });
            }
            entry.agent.transition(AgentState::Running)?;
            entry.worker = Some(self.spawn_worker(&entry.agent));
            (Arc::clone(&entry.agent), from)
        };
        self.after_transition(&agent, from, AgentState::Running).await;
        Ok(())
    }

    /// `Running`/`Paused` -> `Stopped`, draining in-flight work first.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: Uuid) -> Result<()> {
        let (agent, worker) = {
            let mut agents = self.agents.write();
            let entry = agents.get_mut(&id).ok_or(OrchestratorError::AgentNotFound(id))?;
            let state = entry.agent.state();
            if !state.can_transition_to(AgentState::Stopped) {
                return Err(OrchestratorError::InvalidStateTransition {
                    from: state,
                    to: AgentState::Stopped,
                });
            }
            if entry.agent.is_stopping() {
                return Err(OrchestratorError::AgentNotRunning { agent_id: id, state });
            }
            entry.agent.set_stopping(true);
            (Arc::clone(&entry.agent), entry.worker.take())
        };
        debug!("agent {} stopping; draining in-flight tasks", id);
        if let Some(worker) = worker {
            worker
                .shutdown(id, self.config.stop_grace_period() + WORKER_EXIT_SLACK)
                .await;
        }
        self.finish_stop(&agent).await
    }

    /// Apply the `Stopped` transition once the worker is gone.
    async fn finish_stop(&self, agent: &Agent) -> Result<()> {
        let outcome = agent.transition(AgentState::Stopped);
        agent.set_stopping(false);
        let from = outcome?;
        self.after_transition(agent, from, AgentState::Stopped).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn pause(&self, id: Uuid) -> Result<()> {
        self.set_paused(id, true).await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, id: Uuid) -> Result<()> {
        self.set_paused(id, false).await
    }

    async fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        let to = if paused { AgentState::Paused } else { AgentState::Running };
        let (agent, from) = {
            let agents = self.agents.read();
            let entry = agents.get(&id).ok_or(OrchestratorError::AgentNotFound(id))?;
            let from = entry.agent.transition(to)?;
            if let Some(worker) = &entry.worker {
                worker.paused.send_replace(paused);
            }
            (Arc::clone(&entry.agent), from)
        };
        self.after_transition(&agent, from, to).await;
        Ok(())
    }

    /// Stop if active, reset failure counters, and start again. Also the only
    /// way out of `Failed`.
    #[instrument(skip(self))]
    pub async fn restart(&self, id: Uuid) -> Result<()> {
        if self.agent(id)?.state().is_active() {
            self.stop(id).await?;
        }
        let (agent, from, stale) = {
            let mut agents = self.agents.write();
            let entry = agents.get_mut(&id).ok_or(OrchestratorError::AgentNotFound(id))?;
            let from = entry.agent.transition(AgentState::Running)?;
            entry.agent.reset_counters();
            let stale = entry.worker.replace(self.spawn_worker(&entry.agent));
            (Arc::clone(&entry.agent), from, stale)
        };
        if let Some(stale) = stale {
            stale
                .shutdown(id, self.config.stop_grace_period() + WORKER_EXIT_SLACK)
                .await;
        }
        self.after_transition(&agent, from, AgentState::Running).await;
        info!("agent {} restarted", id);
        Ok(())
    }

    /// Stop the agent if needed and drop it from the registry.
    #[instrument(skip(self))]
    pub async fn remove_agent(&self, id: Uuid) -> Result<()> {
        if self.agent(id)?.state().is_active() {
            match self.stop(id).await {
                Ok(()) | Err(OrchestratorError::InvalidStateTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let entry = self
            .agents
            .write()
            .remove(&id)
            .ok_or(OrchestratorError::AgentNotFound(id))?;
        if let Some(worker) = entry.worker {
            worker
                .shutdown(id, self.config.stop_grace_period() + WORKER_EXIT_SLACK)
                .await;
        }
        self.store.remove(Collection::Agents, id);
        info!("removed agent {}", id);
        Ok(())
    }

    async fn after_transition(&self, agent: &Agent, from: AgentState, to: AgentState) {
        info!("agent {} ('{}') {} -> {}", agent.id, agent.name, from, to);
        self.events
            .publish(OrchestratorEvent::agent_state(agent.id, from, to));
        self.store.save(Collection::Agents, agent.id, &agent.snapshot());
    }

    fn spawn_worker(&self, agent: &Arc<Agent>) -> WorkerHandle {
        let (sender, rx) = mpsc::channel(agent.config.queue_capacity);
        let (paused, paused_rx) = watch::channel(false);
        let stop = self.shutdown.child_token();
        let ctx = WorkerContext {
            agent: Arc::clone(agent),
            handlers: Arc::clone(&self.handlers),
            events: Arc::clone(&self.events),
            metrics: Arc::clone(&self.metrics),
            store: self.store.clone(),
            grace: self.config.stop_grace_period(),
            failure_threshold: self.config.failure_threshold,
            stop: stop.clone(),
            abandon: CancellationToken::new(),
        };
        let join = tokio::spawn(run_worker(ctx, rx, paused_rx));
        WorkerHandle {
            sender,
            stop,
            paused,
            join,
        }
    }

    // -----------------------------------------------------------------------
    // Task submission
    // -----------------------------------------------------------------------

    /// Queue `task` on the agent's private queue. Accepted while the agent is
    /// `Running` or `Paused`; never blocks.
    pub fn submit_task(&self, agent_id: Uuid, mut task: Task) -> Result<TaskHandle> {
        if task.attempts == 0 {
            task.attempts = 1;
        }
        self.handlers.validate(&task.task_type, &task.payload)?;

        let agents = self.agents.read();
        let entry = agents
            .get(&agent_id)
            .ok_or(OrchestratorError::AgentNotFound(agent_id))?;
        let state = entry.agent.state();
        let worker = match (&entry.worker, state.is_active()) {
            (Some(worker), true) => worker,
            _ => return Err(OrchestratorError::AgentNotRunning { agent_id, state }),
        };

        let (reply, result) = oneshot::channel();
        let cancel = CancellationToken::new();
        let handle = TaskHandle {
            task_id: task.id,
            agent_id,
            attempt: task.attempts,
            result,
            cancel: cancel.clone(),
        };

        let load = entry.agent.increment_load();
        match worker.sender.try_send(Assignment { task, cancel, reply }) {
            Ok(()) => {
                self.metrics.task_submitted();
                debug!(
                    "queued task {} on agent {} (attempt {}, load {})",
                    handle.task_id, agent_id, handle.attempt, load
                );
                Ok(handle)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                entry.agent.decrement_load();
                Err(OrchestratorError::QueueFull {
                    capacity: entry.agent.config.queue_capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                entry.agent.decrement_load();
                Err(OrchestratorError::AgentNotRunning {
                    agent_id,
                    state: entry.agent.state(),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    pub fn set_health(&self, id: Uuid, health: AgentHealth) -> Result<()> {
        let agent = self.agent(id)?;
        let previous = agent.set_health(health);
        if previous != health {
            info!("agent {} health {} -> {}", id, previous, health);
            self.events.publish(OrchestratorEvent::AgentHealthChanged {
                agent_id: id,
                from: previous,
                to: health,
            });
        }
        Ok(())
    }

    /// Ask the provider about every agent. Provider errors leave the stored
    /// health untouched.
    pub async fn refresh_health(&self, provider: &dyn HealthProvider) {
        let agents: Vec<Arc<Agent>> = self
            .agents
            .read()
            .values()
            .map(|e| Arc::clone(&e.agent))
            .collect();

        for agent in agents {
            match provider.get_health(agent.id).await {
                Ok(health) => {
                    // The agent may have been removed meanwhile.
                    let _ = self.set_health(agent.id, health);
                }
                Err(e) => warn!("health check for agent {} failed: {:#}", agent.id, e),
            }

            if agent.state() == AgentState::Running {
                let stale_after = agent.config.heartbeat_interval() * 3;
                if let Some(last) = agent.last_heartbeat() {
                    let silent = (Utc::now() - last).to_std().unwrap_or_default();
                    if silent > stale_after {
                        warn!("agent {} has not sent a heartbeat for {:?}", agent.id, silent);
                    }
                }
            }
        }
    }

    /// Poll `provider` every `interval` until the runtime shuts down.
    pub fn spawn_health_poller(self: &Arc<Self>, provider: Arc<dyn HealthProvider>, interval: Duration) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = runtime.shutdown.cancelled() => break,
                    _ = ticker.tick() => runtime.refresh_health(provider.as_ref()).await,
                }
            }
            debug!("health poller stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Recovery, metrics, shutdown
    // -----------------------------------------------------------------------

    /// Reload agents persisted by an earlier process. Agents that were
    /// `Running` are started again and `Paused` ones are re-paused.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> usize {
        let snapshots: Vec<AgentSnapshot> = self.store.load_all(Collection::Agents).await;
        let mut recovered = 0;

        for snapshot in snapshots {
            let restored_state = match snapshot.state {
                AgentState::Running | AgentState::Paused | AgentState::Stopped => AgentState::Stopped,
                other => other,
            };
            {
                let mut agents = self.agents.write();
                if agents.contains_key(&snapshot.id) {
                    continue;
                }
                if agents.len() >= self.config.max_agents {
                    warn!("agent limit reached; not recovering agent {}", snapshot.id);
                    break;
                }
                agents.insert(
                    snapshot.id,
                    AgentEntry {
                        agent: Arc::new(Agent::restore(&snapshot, restored_state)),
                        worker: None,
                    },
                );
            }
            recovered += 1;

            let resumed = match snapshot.state {
                AgentState::Running => self.start(snapshot.id).await,
                AgentState::Paused => match self.start(snapshot.id).await {
                    Ok(()) => self.pause(snapshot.id).await,
                    Err(e) => Err(e),
                },
                _ => Ok(()),
            };
            if let Err(e) = resumed {
                warn!("could not resume recovered agent {}: {}", snapshot.id, e);
            }
        }

        info!("recovered {} agent(s) from the repository", recovered);
        recovered
    }

    /// Counters plus agent figures. Queue figures belong to the scheduler.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        let agents = self.agents.read();
        snapshot.agents_total = agents.len();
        for entry in agents.values() {
            *snapshot.agents_by_state.entry(entry.agent.state()).or_default() += 1;
        }
        let depths: Vec<usize> = agents
            .values()
            .filter_map(|e| e.worker.as_ref())
            .map(WorkerHandle::queued)
            .collect();
        if !depths.is_empty() {
            snapshot.average_agent_queue_depth =
                depths.iter().sum::<usize>() as f64 / depths.len() as f64;
        }
        snapshot
    }

    /// Stop every active agent, bounded by `shutdown_timeout`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let active: Vec<Uuid> = self
            .agents
            .read()
            .values()
            .filter(|e| e.agent.state().is_active())
            .map(|e| e.agent.id)
            .collect();
        info!("shutting down runtime ({} active agent(s))", active.len());

        let stops = futures::future::join_all(active.into_iter().map(|id| self.stop(id)));
        match tokio::time::timeout(self.config.shutdown_timeout(), stops).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(|r| r.err()) {
                    warn!("error stopping agent during shutdown: {}", err);
                }
            }
            Err(_) => warn!(
                "runtime shutdown timed out after {:?}",
                self.config.shutdown_timeout()
            ),
        }

        // Stops cut short by the timeout still end in `Stopped`.
        let unfinished: Vec<Arc<Agent>> = self
            .agents
            .read()
            .values()
            .filter(|e| e.agent.is_stopping())
            .map(|e| Arc::clone(&e.agent))
            .collect();
        for agent in unfinished {
            if let Err(e) = self.finish_stop(&agent).await {
                warn!("agent {} left in {}: {}", agent.id, agent.state(), e);
            }
        }

        self.shutdown.cancel();
        let leftovers: Vec<(Uuid, WorkerHandle)> = self
            .agents
            .write()
            .values_mut()
            .filter_map(|e| e.worker.take().map(|w| (e.agent.id, w)))
            .collect();
        for (id, worker) in leftovers {
            worker.shutdown(id, WORKER_EXIT_SLACK).await;
        }
        info!("runtime shutdown complete");
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_worker(ctx: WorkerContext, mut rx: mpsc::Receiver<Assignment>, mut paused: watch::Receiver<bool>) {
    let agent_id = ctx.agent.id;
    let slots = Arc::new(Semaphore::new(ctx.agent.config.max_concurrent_tasks));
    let mut in_flight = JoinSet::new();
    let mut heartbeat = tokio::time::interval(ctx.agent.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("worker for agent {} started", agent_id);

    loop {
        while in_flight.try_join_next().is_some() {}

        if *paused.borrow_and_update() {
            tokio::select! {
                _ = ctx.stop.cancelled() => break,
                changed = paused.changed() => if changed.is_err() { break },
                _ = heartbeat.tick() => ctx.agent.heartbeat(),
            }
            continue;
        }

        let permit = tokio::select! {
            _ = ctx.stop.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => break,
            changed = paused.changed() => if changed.is_err() { break },
            _ = heartbeat.tick() => ctx.agent.heartbeat(),
            assignment = rx.recv() => match assignment {
                Some(assignment) => {
                    in_flight.spawn(execute(ctx.clone(), assignment, permit));
                }
                None => break,
            },
        }
    }

    // Nothing new starts from here on.
    rx.close();
    while let Ok(assignment) = rx.try_recv() {
        let result = TaskResult::cancelled(&assignment.task, agent_id, "agent stopped before the task started");
        ctx.agent.decrement_load();
        ctx.metrics.task_finished(TaskStatus::Cancelled);
        let _ = assignment.reply.send(result);
    }

    let running = in_flight.len();
    if running > 0 {
        debug!("agent {} draining {} in-flight task(s)", agent_id, running);
        let drained = tokio::time::timeout(ctx.grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "agent {} abandoning {} in-flight task(s) after {:?}",
                agent_id,
                in_flight.len(),
                ctx.grace
            );
            ctx.abandon.cancel();
            while in_flight.join_next().await.is_some() {}
        }
    }
    debug!("worker for agent {} stopped", agent_id);
}

async fn execute(ctx: WorkerContext, assignment: Assignment, _permit: OwnedSemaphorePermit) {
    let Assignment { mut task, cancel, reply } = assignment;
    if task.attempts == 0 {
        task.attempts = 1;
    }
    let agent_id = ctx.agent.id;
    let started_at = Utc::now();

    let result = if cancel.is_cancelled() {
        TaskResult::cancelled(&task, agent_id, "task cancelled before it started")
    } else {
        match ctx.handlers.get(&task.task_type) {
            Ok(handler) => run_handler(&ctx, handler, &task, &cancel).await,
            Err(e) => TaskResult::failed(&task, agent_id, e.to_string(), false, started_at),
        }
    };

    finish(&ctx, &task, result, reply).await;
}

enum Interrupt {
    TimedOut(Duration),
    Cancelled,
    Abandoned,
}

async fn run_handler(
    ctx: &WorkerContext,
    handler: Arc<dyn TaskHandler>,
    task: &Task,
    cancel: &CancellationToken,
) -> TaskResult {
    let agent_id = ctx.agent.id;
    let started_at = Utc::now();
    let timeout = task
        .timeout()
        .unwrap_or_else(|| ctx.agent.config.default_task_timeout());
    let token = CancellationToken::new();
    let task_ctx = TaskContext {
        task_id: task.id,
        task_type: task.task_type.clone(),
        agent_id,
        attempt: task.attempts,
        cancel: token.clone(),
    };
    let payload = task.payload.clone();
    let mut join = tokio::spawn(async move { handler.handle(payload, &task_ctx).await });

    let interrupt = tokio::select! {
        joined = &mut join => return handler_outcome(task, agent_id, joined, started_at),
        _ = tokio::time::sleep(timeout) => Interrupt::TimedOut(timeout),
        _ = cancel.cancelled() => Interrupt::Cancelled,
        _ = ctx.abandon.cancelled() => Interrupt::Abandoned,
    };

    token.cancel();
    if !matches!(interrupt, Interrupt::Abandoned) {
        tokio::select! {
            exited = tokio::time::timeout(ctx.grace, &mut join) => {
                if exited.is_err() {
                    warn!("handler for task {} ignored cancellation; detaching it", task.id);
                }
            }
            _ = ctx.abandon.cancelled() => {}
        }
    }
    // Dropping the join handle detaches a handler that is still running.
    drop(join);

    match interrupt {
        Interrupt::TimedOut(after) => {
            warn!("task {} timed out after {:?} on agent {}", task.id, after, agent_id);
            let error = OrchestratorError::TaskTimeout {
                task_id: task.id,
                timeout_ms: after.as_millis() as u64,
            };
            TaskResult {
                error: Some(error.to_string()),
                ..TaskResult::timed_out(task, agent_id, after, started_at)
            }
        }
        Interrupt::Cancelled => TaskResult {
            started_at,
            ..TaskResult::cancelled(task, agent_id, "task cancelled")
        },
        Interrupt::Abandoned => TaskResult {
            started_at,
            ..TaskResult::cancelled(task, agent_id, "agent stopped while the task was running")
        },
    }
}

fn handler_outcome(
    task: &Task,
    agent_id: Uuid,
    joined: std::result::Result<std::result::Result<Value, HandlerError>, JoinError>,
    started_at: chrono::DateTime<Utc>,
) -> TaskResult {
    match joined {
        Ok(Ok(output)) => TaskResult::completed(task, agent_id, output, started_at),
        Ok(Err(HandlerError::Cancelled)) => TaskResult {
            started_at,
            ..TaskResult::cancelled(task, agent_id, "handler cancelled")
        },
        Ok(Err(e)) => TaskResult::failed(task, agent_id, e.to_string(), e.is_retryable(), started_at),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!("handler for task {} panicked: {}", task.id, message);
            TaskResult::failed(task, agent_id, format!("handler panicked: {message}"), true, started_at)
        }
        Err(e) => TaskResult::failed(task, agent_id, e.to_string(), true, started_at),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

async fn finish(ctx: &WorkerContext, task: &Task, result: TaskResult, reply: oneshot::Sender<TaskResult>) {
    let agent = &ctx.agent;
    agent.decrement_load();
    agent.heartbeat();
    ctx.metrics.task_finished(result.status);

    let mut tripped = None;
    match result.status {
        TaskStatus::Completed => agent.record_success(),
        TaskStatus::Failed | TaskStatus::TimedOut => {
            let failures = agent.record_failure(result.error.as_deref().unwrap_or("task failed"));
            if failures >= ctx.failure_threshold {
                tripped = agent
                    .fail(format!("{failures} consecutive task failures"))
                    .map(|from| (from, failures));
            }
        }
        TaskStatus::Cancelled => {}
    }

    debug!(
        "task {} on agent {} finished: {} (attempt {})",
        task.id, agent.id, result.status, result.attempt
    );
    ctx.events.publish(OrchestratorEvent::TaskCompleted {
        task_id: task.id,
        agent_id: agent.id,
        task_type: task.task_type.clone(),
        status: result.status,
        attempt: result.attempt,
        duration_ms: result.duration().as_millis() as u64,
    });
    let _ = reply.send(result);

    if let Some((from, failures)) = tripped {
        error!(
            "agent {} ('{}') failed after {} consecutive task failures",
            agent.id, agent.name, failures
        );
        ctx.events
            .publish(OrchestratorEvent::agent_state(agent.id, from, AgentState::Failed));
        ctx.stop.cancel();
        ctx.store.save(Collection::Agents, agent.id, &agent.snapshot());
    }
}
