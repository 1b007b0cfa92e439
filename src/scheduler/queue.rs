use crate::scheduler::types::TaskExecution;
use crate::store::TaskId;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

/// Min-priority queue of pending executions.
///
/// Ordered by `(priority, scheduled_time, insertion order)`, so lower priority
/// values run first and equal keys stay FIFO.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    next_seq: u64,
    per_task: HashMap<TaskId, usize>,
}

struct QueueEntry {
    seq: u64,
    execution: TaskExecution,
}

impl QueueEntry {
    fn key(&self) -> (u32, DateTime<Utc>, u64) {
        (self.execution.priority, self.execution.scheduled_time, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, execution: TaskExecution) {
        *self.per_task.entry(execution.task_id).or_default() += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(QueueEntry { seq, execution }));
    }

    /// Pop the head if it is due at `now`. A head that is not yet due stays
    /// in place and nothing is returned.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<TaskExecution> {
        if self.heap.peek()?.0.execution.scheduled_time > now {
            return None;
        }
        self.pop()
    }

    pub fn pop(&mut self) -> Option<TaskExecution> {
        let Reverse(entry) = self.heap.pop()?;
        let task_id = entry.execution.task_id;
        if let Some(count) = self.per_task.get_mut(&task_id) {
            *count -= 1;
            if *count == 0 {
                self.per_task.remove(&task_id);
            }
        }
        Some(entry.execution)
    }

    pub fn peek(&self) -> Option<&TaskExecution> {
        self.heap.peek().map(|Reverse(entry)| &entry.execution)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.per_task.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove everything, returning the executions in queue order
    pub fn drain(&mut self) -> Vec<TaskExecution> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(execution) = self.pop() {
            drained.push(execution);
        }
        drained
    }
}
