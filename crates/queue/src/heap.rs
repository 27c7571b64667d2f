//! Indexed binary max-heap over tasks.
//!
//! Ordered by `(priority desc, seq asc)`, so equal priorities leave in
//! insertion order. A `task id -> slot` index makes removal and
//! re-prioritisation O(log n).

use std::collections::HashMap;

use uuid::Uuid;

use crate::Task;

#[derive(Debug)]
struct Entry {
    priority: i32,
    seq: u64,
    task: Task,
}

impl Entry {
    fn outranks(&self, other: &Entry) -> bool {
        self.priority > other.priority || (self.priority == other.priority && self.seq < other.seq)
    }
}

#[derive(Debug, Default)]
pub struct IndexedHeap {
    entries: Vec<Entry>,
    index: HashMap<Uuid, usize>,
}

impl IndexedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.contains_key(id)
    }

    /// Insert a task. `seq` must be unique and increasing across pushes.
    pub fn push(&mut self, task: Task, seq: u64) {
        let slot = self.entries.len();
        self.index.insert(task.id, slot);
        self.entries.push(Entry {
            priority: task.priority,
            seq,
            task,
        });
        self.sift_up(slot);
    }

    pub fn peek(&self) -> Option<&Task> {
        self.entries.first().map(|e| &e.task)
    }

    pub fn pop(&mut self) -> Option<Task> {
        if self.entries.is_empty() {
            return None;
        }
        self.take(0)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Task> {
        let slot = *self.index.get(id)?;
        self.take(slot)
    }

    /// Change a queued task's priority. Returns `false` if it is not queued.
    pub fn update_priority(&mut self, id: &Uuid, priority: i32) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        let entry = &mut self.entries[slot];
        entry.priority = priority;
        entry.task.priority = priority;
        self.repair(slot);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.entries.iter().map(|e| &e.task)
    }

    /// Remove every task, in no particular order.
    pub fn drain(&mut self) -> Vec<Task> {
        self.index.clear();
        self.entries.drain(..).map(|e| e.task).collect()
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn take(&mut self, slot: usize) -> Option<Task> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap(slot, last);
        let entry = self.entries.pop()?;
        self.index.remove(&entry.task.id);
        if slot < self.entries.len() {
            self.repair(slot);
        }
        Some(entry.task)
    }

    fn repair(&mut self, slot: usize) {
        if slot > 0 && self.entries[slot].outranks(&self.entries[(slot - 1) / 2]) {
            self.sift_up(slot);
        } else {
            self.sift_down(slot);
        }
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.entries[slot].outranks(&self.entries[parent]) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut best = slot;
            if left < len && self.entries[left].outranks(&self.entries[best]) {
                best = left;
            }
            if right < len && self.entries[right].outranks(&self.entries[best]) {
                best = right;
            }
            if best == slot {
                break;
            }
            self.swap(slot, best);
            slot = best;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.index.insert(self.entries[a].task.id, a);
        self.index.insert(self.entries[b].task.id, b);
    }
}
