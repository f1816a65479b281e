//! Bounded task queue of a master
//!
//! Many submitters, one consumer (the control loop). The lock only guards the
//! deque itself; `depth()` is readable without it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::task::Task;

pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    /// Tasks submitted but not yet claimed by the dispatcher.
    depth: AtomicUsize,
    max_depth: usize,
}

impl TaskQueue {
    /// Creates an empty queue that holds at most `max_depth` tasks.
    pub fn new(max_depth: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            depth: AtomicUsize::new(0),
            max_depth,
        }
    }

    /// Appends the task unless the queue is full. A rejected task is dropped
    /// and the queue is left untouched.
    pub fn submit(&self, task: Task) -> bool {
        let mut tasks = self.lock();

        if self.depth.load(Ordering::SeqCst) >= self.max_depth {
            tracing::warn!(
                "Rejecting task {}: queue full ({} tasks)",
                task.id(),
                self.max_depth
            );
            return false;
        }

        tracing::debug!("Queued task {}", task.id());
        tasks.push_back(task);
        self.depth.fetch_add(1, Ordering::SeqCst);
        true
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Claims the oldest task. Depth drops before the task leaves the deque,
    /// so it counts unclaimed rather than unfinished tasks.
    pub(crate) fn dequeue(&self) -> Option<Task> {
        let mut tasks = self.lock();
        if tasks.is_empty() {
            return None;
        }

        self.depth.fetch_sub(1, Ordering::SeqCst);
        tasks.pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        // a panicking submitter cannot leave the deque half-modified
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
