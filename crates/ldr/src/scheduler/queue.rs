use std::collections::VecDeque;

use crate::task::{TaskId, TaskRecord};

/// A queued task and how many ConnectionLost retries it has used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub task: TaskRecord,
    pub attempts: u32,
}

impl PendingTask {
    pub fn new(task: TaskRecord) -> Self {
        Self { task, attempts: 0 }
    }
}

/// Pending tasks, highest priority first, FIFO within a priority.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingTask>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue behind every task of the same or higher priority.
    pub fn push(&mut self, pending: PendingTask) {
        let priority = pending.task.priority;
        let at = self
            .entries
            .iter()
            .position(|p| p.task.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, pending);
    }

    /// Re-enqueue ahead of every task of the same or lower priority.
    pub fn push_front(&mut self, pending: PendingTask) {
        let priority = pending.task.priority;
        let at = self
            .entries
            .iter()
            .position(|p| p.task.priority <= priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, pending);
    }

    pub fn take(&mut self, index: usize) -> Option<PendingTask> {
        self.entries.remove(index)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<PendingTask> {
        let index = self.entries.iter().position(|p| p.task.id == id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.iter().any(|p| p.task.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingTask> {
        self.entries.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingTask> + '_ {
        self.entries.drain(..)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
