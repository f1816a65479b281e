//! Tasks and completion listeners
//!
//! A [`Task`] is what sits in the master's queue: a payload plus everyone who
//! wants to hear about its execution. Listeners are told when execution
//! starts and always get a completion call with one result code per slave,
//! even if the execution failed as a whole.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::types::{TaskId, TaskPayload};
use crate::cluster::types::NodeId;
use crate::net::Network;
use crate::net::protocol::Message;

pub trait TaskListener: Send + Sync {
    fn execution_started(&self, task_id: &TaskId);

    /// `codes[i]` is the result of the i-th slave of the execution.
    fn execution_completed(&self, task_id: &TaskId, codes: &[i32]);
}

pub struct Task {
    id: TaskId,
    payload: Option<TaskPayload>,
    listeners: Vec<Arc<dyn TaskListener>>,
}

impl Task {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: TaskId::new(),
            payload: Some(payload),
            listeners: Vec::new(),
        }
    }

    /// A task that carries nothing to execute. The master drops it unexecuted.
    pub fn without_payload() -> Self {
        Self {
            id: TaskId::new(),
            payload: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn TaskListener>) {
        self.listeners.push(listener);
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn payload(&self) -> Option<&TaskPayload> {
        self.payload.as_ref()
    }

    pub(crate) fn notify_started(&self) {
        for listener in &self.listeners {
            listener.execution_started(&self.id);
        }
    }

    pub(crate) fn notify_completed(&self, codes: &[i32]) {
        for listener in &self.listeners {
            listener.execution_completed(&self.id, codes);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.payload.as_ref().map(|p| p.kind.as_str()))
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskRecord {
    Running,
    Completed { codes: Vec<i32> },
}

/// Completed records a [`ResultStore`] keeps before evicting the oldest.
pub const DEFAULT_RESULT_CAPACITY: usize = 1024;

/// Keeps the outcome of tasks so it can be queried after the fact.
///
/// Bounded: once more than `capacity` tasks are known, the oldest completed
/// records are dropped. Running records are never evicted.
pub struct ResultStore {
    records: DashMap<TaskId, TaskRecord>,
    order: Mutex<VecDeque<TaskId>>,
    capacity: usize,
    completed: Notify,
}

impl ResultStore {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_RESULT_CAPACITY)
    }

    /// Creates a store that retains at most `capacity` completed records.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            completed: Notify::new(),
        })
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.records.get(task_id).map(|entry| entry.value().clone())
    }

    /// Stores the final result codes of a task and wakes every [`wait`](Self::wait)er.
    pub fn record_completed(&self, task_id: &TaskId, codes: Vec<i32>) {
        let previous = self
            .records
            .insert(task_id.clone(), TaskRecord::Completed { codes });
        if previous.is_none() {
            self.track(task_id);
        }
        self.evict();
        self.completed.notify_waiters();
    }

    /// Marks a task as running unless its outcome is already known.
    ///
    /// A forwarded task's completion report can overtake the acknowledgement
    /// of its submission, so a completed record is never downgraded.
    pub fn record_running(&self, task_id: &TaskId) {
        let mut inserted = false;
        self.records.entry(task_id.clone()).or_insert_with(|| {
            inserted = true;
            TaskRecord::Running
        });
        if inserted {
            self.track(task_id);
            self.evict();
        }
    }

    /// Waits until the task has completed and returns its result codes.
    pub async fn wait(&self, task_id: &TaskId) -> Vec<i32> {
        loop {
            let notified = self.completed.notified();
            if let Some(TaskRecord::Completed { codes }) = self.get(task_id) {
                return codes;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn track(&self, task_id: &TaskId) {
        if let Ok(mut order) = self.order.lock() {
            order.push_back(task_id.clone());
        }
    }

    fn evict(&self) {
        let Ok(mut order) = self.order.lock() else {
            return;
        };

        while self.records.len() > self.capacity {
            let Some(position) = order.iter().position(|id| {
                matches!(
                    self.records.get(id).map(|entry| entry.value().clone()),
                    Some(TaskRecord::Completed { .. }) | None
                )
            }) else {
                break;
            };
            if let Some(oldest) = order.remove(position) {
                tracing::trace!("Evicting result of task {}", oldest);
                self.records.remove(&oldest);
            }
        }
    }
}

impl TaskListener for ResultStore {
    fn execution_started(&self, task_id: &TaskId) {
        self.record_running(task_id);
    }

    fn execution_completed(&self, task_id: &TaskId, codes: &[i32]) {
        self.record_completed(task_id, codes.to_vec());
    }
}

/// Reports completion of a forwarded task back to the node that submitted it.
pub struct RemoteResultListener {
    network: Arc<dyn Network>,
    origin: NodeId,
}

impl RemoteResultListener {
    pub fn new(network: Arc<dyn Network>, origin: NodeId) -> Arc<Self> {
        Arc::new(Self { network, origin })
    }
}

impl TaskListener for RemoteResultListener {
    fn execution_started(&self, task_id: &TaskId) {
        tracing::trace!("Forwarded task {} started for {}", task_id, self.origin);
    }

    fn execution_completed(&self, task_id: &TaskId, codes: &[i32]) {
        let network = self.network.clone();
        let origin = self.origin.clone();
        let message = Message::TaskFinished {
            task_id: task_id.clone(),
            codes: codes.to_vec(),
        };

        tokio::spawn(async move {
            if let Err(e) = network.send(&origin, message).await {
                tracing::warn!("Could not report task result to {}: {}", origin, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_late_start_does_not_hide_completed_result() {
        // ARRANGE: the completion report arrives before the submit acknowledgement
        let store = ResultStore::new();
        let id = TaskId::new();
        store.record_completed(&id, vec![7]);

        // ACT
        store.execution_started(&id);

        // ASSERT
        assert_eq!(
            store.get(&id),
            Some(TaskRecord::Completed { codes: vec![7] })
        );
        let codes = tokio::time::timeout(Duration::from_millis(200), store.wait(&id))
            .await
            .unwrap();
        assert_eq!(codes, vec![7]);
    }

    #[test]
    fn test_started_then_completed_is_tracked_once() {
        let store = ResultStore::with_capacity(4);
        let id = TaskId::new();

        store.execution_started(&id);
        assert_eq!(store.get(&id), Some(TaskRecord::Running));

        store.execution_completed(&id, &[1, 2]);

        assert_eq!(store.len(), 1);
        assert_eq!(store.order.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_oldest_completed_records_are_evicted() {
        // ARRANGE
        let store = ResultStore::with_capacity(2);
        let running = TaskId::new();
        let first = TaskId::new();
        let second = TaskId::new();
        let third = TaskId::new();
        store.record_running(&running);

        // ACT
        store.record_completed(&first, vec![1]);
        store.record_completed(&second, vec![2]);
        store.record_completed(&third, vec![3]);

        // ASSERT: the running record survives, the oldest completed ones go
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&running), Some(TaskRecord::Running));
        assert_eq!(store.get(&first), None);
        assert_eq!(store.get(&second), None);
        assert_eq!(store.get(&third), Some(TaskRecord::Completed { codes: vec![3] }));
    }
}
