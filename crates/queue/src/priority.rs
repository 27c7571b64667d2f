//! `TaskQueue`: bounded, priority-ordered queue with delayed tasks.
//!
//! Ready tasks sit in an [`IndexedHeap`]. Tasks with a future `scheduled_at`
//! wait in a time-ordered set and become visible to `dequeue` once
//! [`TaskQueue::promote_due`] moves them over. Consumers block on a
//! [`Notify`] rather than polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::heap::IndexedHeap;
use crate::{QueueError, Task};

type DelayKey = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct QueueState {
    ready: IndexedHeap,
    delayed: BTreeMap<DelayKey, Task>,
    delayed_index: HashMap<Uuid, DelayKey>,
    seq: u64,
    closed: bool,
    depth_sum: u64,
    depth_samples: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ready.contains(id) || self.delayed_index.contains_key(id)
    }

    fn sample_depth(&mut self) {
        self.depth_sum += self.len() as u64;
        self.depth_samples += 1;
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Thread-safe priority queue shared by producers and the dispatch loop.
#[derive(Debug)]
pub struct TaskQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a task. Tasks scheduled in the future are held back until due.
    ///
    /// # Errors
    /// - [`QueueError::Shutdown`] once the queue is closed.
    /// - [`QueueError::Full`] when ready + delayed tasks reach capacity.
    /// - [`QueueError::Duplicate`] when a task with the same id is queued.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let now = Utc::now();
        let ready = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Shutdown);
            }
            if state.len() >= self.capacity {
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            if state.contains(&task.id) {
                return Err(QueueError::Duplicate(task.id));
            }

            let seq = state.next_seq();
            let ready = task.is_due(now);
            debug!(
                "enqueue task {} (type '{}', priority {}, ready {})",
                task.id, task.task_type, task.priority, ready
            );
            match task.scheduled_at.filter(|_| !ready) {
                Some(at) => {
                    state.delayed_index.insert(task.id, (at, seq));
                    state.delayed.insert((at, seq), task);
                }
                None => state.ready.push(task, seq),
            }
            state.sample_depth();
            ready
        };

        if ready {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Put back a task that was already admitted, hidden until `until`.
    ///
    /// Capacity is not checked again: the task gave up its slot only when it
    /// was dequeued. Priority and id are kept.
    ///
    /// # Errors
    /// [`QueueError::Shutdown`] or [`QueueError::Duplicate`], as for
    /// [`enqueue`](Self::enqueue).
    pub fn defer(&self, mut task: Task, until: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Shutdown);
        }
        if state.contains(&task.id) {
            return Err(QueueError::Duplicate(task.id));
        }
        task.scheduled_at = Some(until);
        let seq = state.next_seq();
        debug!("defer task {} until {}", task.id, until);
        state.delayed_index.insert(task.id, (until, seq));
        state.delayed.insert((until, seq), task);
        state.sample_depth();
        Ok(())
    }

    /// Wait for the highest-priority ready task.
    ///
    /// Remaining ready tasks are still handed out after [`close`](Self::close);
    /// `Shutdown` is returned once the queue is both closed and empty.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Task, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pop_ready()? {
                return Ok(task);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Non-blocking variant of [`dequeue`](Self::dequeue).
    pub fn try_dequeue(&self) -> Option<Task> {
        self.pop_ready().ok().flatten()
    }

    fn pop_ready(&self) -> Result<Option<Task>, QueueError> {
        let (task, more) = {
            let mut state = self.state.lock();
            match state.ready.pop() {
                Some(task) => {
                    state.sample_depth();
                    (task, !state.ready.is_empty())
                }
                None if state.closed => return Err(QueueError::Shutdown),
                None => return Ok(None),
            }
        };
        // Pass the baton in case a woken consumer gave up before taking its turn.
        if more {
            self.notify.notify_one();
        }
        Ok(Some(task))
    }

    /// Take a queued task out, whether ready or delayed.
    pub fn remove(&self, id: &Uuid) -> Result<Task, QueueError> {
        let mut state = self.state.lock();
        if let Some(task) = state.ready.remove(id) {
            return Ok(task);
        }
        let key = state
            .delayed_index
            .remove(id)
            .ok_or(QueueError::NotFound(*id))?;
        state.delayed.remove(&key).ok_or(QueueError::NotFound(*id))
    }

    pub fn update_priority(&self, id: &Uuid, priority: i32) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.ready.update_priority(id, priority) {
            return Ok(());
        }
        let key = *state.delayed_index.get(id).ok_or(QueueError::NotFound(*id))?;
        match state.delayed.get_mut(&key) {
            Some(task) => {
                task.priority = priority;
                Ok(())
            }
            None => Err(QueueError::NotFound(*id)),
        }
    }

    /// Move every delayed task due at `now` into the ready heap.
    pub fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let promoted = {
            let mut state = self.state.lock();
            let mut promoted = 0;
            while let Some(entry) = state.delayed.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let ((_, seq), task) = entry.remove_entry();
                state.delayed_index.remove(&task.id);
                state.ready.push(task, seq);
                promoted += 1;
            }
            promoted
        };

        if promoted > 0 {
            debug!("promoted {} scheduled task(s)", promoted);
            for _ in 0..promoted {
                self.notify.notify_one();
            }
        }
        promoted
    }

    /// Run [`promote_due`](Self::promote_due) on a ticker until cancelled.
    pub fn spawn_promoter(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.promote_due(Utc::now());
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("scheduled-task promoter stopped");
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.state.lock().delayed.len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.state.lock().contains(id)
    }

    /// Reject further enqueues and wake every waiting consumer.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        info!("task queue closed");
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Remove and return every queued task, ready and delayed.
    pub fn drain(&self) -> Vec<Task> {
        let mut state = self.state.lock();
        let mut tasks = state.ready.drain();
        state.delayed_index.clear();
        tasks.extend(std::mem::take(&mut state.delayed).into_values());
        tasks
    }

    /// Mean queue depth observed at every enqueue and dequeue so far.
    pub fn average_depth(&self) -> f64 {
        let state = self.state.lock();
        if state.depth_samples == 0 {
            0.0
        } else {
            state.depth_sum as f64 / state.depth_samples as f64
        }
    }
}
