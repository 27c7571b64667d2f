//! Global task scheduler.
//!
//! Standalone tasks (outside any workflow) go through a single priority
//! queue. A dispatch loop dequeues them in priority order, asks the
//! coordinator for an agent and hands them to the runtime. A task no agent
//! can take right now (none eligible, or the chosen agent's queue is full)
//! goes back into the queue, hidden for `dispatch_retry_interval` with its
//! priority unchanged, and the loop moves on to the next task.
//!
//! Retryable failures go back into the queue with a backoff delay until the
//! task's `max_retries` is used up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use db::Collection;
use queue::{QueueError, Task, TaskQueue, TaskResult, TaskStatus};

use crate::config::{EngineConfig, QueueConfig};
use crate::coordinator::Coordinator;
use crate::error::{OrchestratorError, Result};
use crate::metrics::MetricsSnapshot;
use crate::runtime::{dropped_result, AgentRuntime, TaskHandle};
use crate::store::Store;

/// Receives the final result of a submitted task.
#[derive(Debug)]
pub struct TaskTicket {
    pub task_id: Uuid,
    result: oneshot::Receiver<Result<TaskResult>>,
}

impl TaskTicket {
    pub async fn wait(self) -> Result<TaskResult> {
        self.result
            .await
            .unwrap_or(Err(OrchestratorError::SchedulerShutdown))
    }
}

struct Waiter {
    reply: oneshot::Sender<Result<TaskResult>>,
    cancel: CancellationToken,
}

pub struct TaskScheduler {
    queue: Arc<TaskQueue>,
    runtime: Arc<AgentRuntime>,
    coordinator: Arc<Coordinator>,
    config: QueueConfig,
    retry: EngineConfig,
    store: Store,
    waiters: Mutex<HashMap<Uuid, Waiter>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(
        config: QueueConfig,
        retry: EngineConfig,
        runtime: Arc<AgentRuntime>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new(config.capacity)),
            runtime,
            coordinator,
            config,
            retry,
            store: Store::default(),
            waiters: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_store(mut self, store: Store) -> Self {
        self.store = store;
        self
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Queue a task for dispatch.
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn submit(&self, task: Task) -> Result<TaskTicket> {
        if self.shutdown.is_cancelled() || self.queue.is_closed() {
            return Err(OrchestratorError::SchedulerShutdown);
        }
        self.runtime.handlers().validate(&task.task_type, &task.payload)?;

        let task_id = task.id;
        let (reply, result) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            if waiters.contains_key(&task_id) {
                return Err(queue::QueueError::Duplicate(task_id).into());
            }
            waiters.insert(
                task_id,
                Waiter {
                    reply,
                    cancel: CancellationToken::new(),
                },
            );
        }

        if let Err(e) = self.queue.enqueue(task.clone()) {
            self.waiters.lock().remove(&task_id);
            return Err(e.into());
        }
        self.store.save(Collection::Tasks, task_id, &task);
        debug!("task {} queued (priority {})", task_id, task.priority);
        Ok(TaskTicket { task_id, result })
    }

    /// Cancel a task wherever it is: still queued, waiting for an agent, or
    /// running.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        if let Ok(task) = self.queue.remove(&task_id) {
            info!("task {} cancelled before dispatch", task_id);
            let result = TaskResult::cancelled(&task, Uuid::nil(), "cancelled before dispatch");
            self.resolve(task_id, Ok(result));
            return Ok(());
        }

        let waiters = self.waiters.lock();
        let waiter = waiters
            .get(&task_id)
            .ok_or(OrchestratorError::TaskNotFound(task_id))?;
        waiter.cancel.cancel();
        info!("cancellation requested for task {}", task_id);
        Ok(())
    }

    pub fn update_priority(&self, task_id: Uuid, priority: i32) -> Result<()> {
        Ok(self.queue.update_priority(&task_id, priority)?)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the delayed-task promoter and the dispatch loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        workers.push(
            self.queue
                .spawn_promoter(self.config.promote_interval(), self.shutdown.child_token()),
        );
        let scheduler = Arc::clone(self);
        workers.push(tokio::spawn(async move { scheduler.dispatch_loop().await }));
        info!(
            "scheduler started (capacity {}, strategy {})",
            self.queue.capacity(),
            self.coordinator.strategy_name()
        );
    }

    /// Re-queue tasks persisted by an earlier process. Their results have no
    /// waiter and are only logged.
    pub async fn recover(&self) -> usize {
        let tasks: Vec<Task> = self.store.load_all(Collection::Tasks).await;
        let mut requeued = 0;
        for task in tasks {
            if self.queue.contains(&task.id) || self.waiters.lock().contains_key(&task.id) {
                continue;
            }
            let task_id = task.id;
            match self.queue.enqueue(task) {
                Ok(()) => requeued += 1,
                Err(e) => warn!("could not re-queue task {}: {}", task_id, e),
            }
        }
        info!("re-queued {} persisted task(s)", requeued);
        requeued
    }

    /// Close the queue and stop the background loops. Tasks still queued
    /// stay persisted; their waiters get `SchedulerShutdown`.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.queue.close();
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }

        let dropped = self.queue.drain();
        let waiters: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.reply.send(Err(OrchestratorError::SchedulerShutdown));
        }
        info!("scheduler stopped; {} queued task(s) left undispatched", dropped.len());
    }

    /// Add the global queue figures to `snapshot`.
    pub fn fill_metrics(&self, snapshot: &mut MetricsSnapshot) {
        snapshot.global_queue_depth = self.queue.len();
        snapshot.average_global_queue_depth = self.queue.average_depth();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let task = match self.queue.dequeue(&self.shutdown).await {
                Ok(task) => task,
                Err(e) => {
                    debug!("dispatch loop exiting: {}", e);
                    break;
                }
            };
            self.dispatch(task);
        }
    }

    fn dispatch(self: &Arc<Self>, mut task: Task) {
        if task.attempts == 0 {
            task.next_attempt();
        }
        let cancel = self
            .waiters
            .lock()
            .get(&task.id)
            .map(|w| w.cancel.clone())
            .unwrap_or_default();
        if cancel.is_cancelled() {
            let result = TaskResult::cancelled(&task, Uuid::nil(), "cancelled before dispatch");
            self.resolve(task.id, Ok(result));
            return;
        }

        let candidates = self.runtime.running_agents();
        let submitted = self
            .coordinator
            .select_agent(&task, &candidates)
            .and_then(|agent| self.runtime.submit_task(agent.id, task.clone()));

        match submitted {
            Ok(handle) => {
                debug!("task {} dispatched to agent {}", task.id, handle.agent_id);
                self.spawn_forwarder(handle, task, cancel);
            }
            Err(e) if e.is_transient() => {
                debug!("task {} not dispatchable yet: {}", task.id, e);
                self.defer(task, self.config.dispatch_retry_interval());
            }
            Err(e) => {
                warn!("task {} cannot be dispatched: {}", task.id, e);
                self.resolve(task.id, Err(e));
            }
        }
    }

    /// Park `task` in the delayed set so the loop moves on to the next one.
    fn defer(&self, task: Task, delay: Duration) {
        let until = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let task_id = task.id;
        match self.queue.defer(task, until) {
            Ok(()) => {}
            // The persisted copy survives for the next `recover`.
            Err(QueueError::Shutdown) => debug!("task {} left queued at shutdown", task_id),
            Err(e) => {
                warn!("could not defer task {}: {}", task_id, e);
                self.resolve(task_id, Err(e.into()));
            }
        }
    }

    fn spawn_forwarder(self: &Arc<Self>, mut handle: TaskHandle, task: Task, cancel: CancellationToken) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = &mut handle.result => result.ok(),
                _ = cancel.cancelled() => {
                    handle.cancel();
                    (&mut handle.result).await.ok()
                }
            };
            let result =
                result.unwrap_or_else(|| dropped_result(task.id, handle.agent_id, handle.attempt));
            scheduler.on_result(task, result, &cancel);
        });
    }

    fn on_result(&self, mut task: Task, result: TaskResult, cancel: &CancellationToken) {
        let failed = match result.status {
            TaskStatus::Completed => false,
            TaskStatus::Failed | TaskStatus::TimedOut => result.retryable,
            // Cancelled by the agent stopping rather than by the caller.
            TaskStatus::Cancelled => !cancel.is_cancelled(),
        };
        let can_retry = failed
            && task.attempts <= task.max_retries
            && !cancel.is_cancelled()
            && !self.shutdown.is_cancelled();

        if can_retry {
            let delay = self.retry.retry_delay(task.attempts);
            task.next_attempt();
            warn!(
                "task {} attempt {} {}; retrying in {:?}",
                task.id, result.attempt, result.status, delay
            );
            let until = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            match self.queue.defer(task.clone(), until) {
                Ok(()) => {
                    task.scheduled_at = Some(until);
                    self.store.save(Collection::Tasks, task.id, &task);
                    return;
                }
                Err(e) => warn!("could not re-queue task {}: {}", task.id, e),
            }
        }

        debug!("task {} finished: {}", task.id, result.status);
        self.resolve(task.id, Ok(result));
    }

    fn resolve(&self, task_id: Uuid, result: Result<TaskResult>) {
        let waiter = self.waiters.lock().remove(&task_id);
        if let Some(waiter) = waiter {
            let _ = waiter.reply.send(result);
        }
        self.store.remove(Collection::Tasks, task_id);
    }
}
