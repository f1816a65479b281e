//! Master role
//!
//! Owns the task queue, the membership registry and the group barrier. The
//! control loop dequeues and dispatches; network callbacks handle joins,
//! signals and forwarded submissions concurrently with it.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use super::barrier::BarrierAdapter;
use super::dispatch::ExecutionDispatcher;
use super::membership::MembershipRegistry;
use super::node::{RoleBehavior, ShutdownSignal, StateCell};
use super::queue::TaskQueue;
use super::signal::{SignalChannel, SignalKind};
use super::task::{RemoteResultListener, ResultStore, Task};
use super::types::{
    ComputeGroup, ComputeRole, ComputeState, JOIN_ACCEPTED, JOIN_TRY_LATER, TaskId, TaskPayload,
};
use crate::cluster::Liveness;
use crate::cluster::types::NodeId;
use crate::config::ComputeConfig;
use crate::directory::{Directory, DirectoryEntry, master_key};
use crate::error::{ComputeError, Result};
use crate::net::Network;
use crate::net::protocol::{Envelope, Message, MessageKind};
use crate::net::registry::message_handler;
use crate::sync::BarrierService;

pub struct ComputeMaster {
    config: ComputeConfig,
    network: Arc<dyn Network>,
    directory: Arc<dyn Directory>,
    liveness: Arc<dyn Liveness>,
    queue: TaskQueue,
    membership: Arc<MembershipRegistry>,
    barrier: Arc<BarrierAdapter>,
    dispatcher: ExecutionDispatcher,
    signals: SignalChannel,
    results: Arc<ResultStore>,
    state: StateCell,
    last_sweep: Mutex<Instant>,
}

impl ComputeMaster {
    /// Allocates the group barrier and registers the master's message handlers.
    /// The control loop is started separately through [`super::node::ComputeNode`].
    pub async fn new(
        config: ComputeConfig,
        network: Arc<dyn Network>,
        barriers: Arc<dyn BarrierService>,
        directory: Arc<dyn Directory>,
        liveness: Arc<dyn Liveness>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        // the master alone signs on until slaves join
        let barrier = Arc::new(BarrierAdapter::allocate_for(barriers, 1).await?);
        let membership = Arc::new(MembershipRegistry::new());

        let dispatcher = ExecutionDispatcher::new(
            config.group,
            network.clone(),
            liveness.clone(),
            membership.clone(),
            barrier.clone(),
            config.quorum_poll(),
        );

        let master = Arc::new(Self {
            queue: TaskQueue::new(config.max_queue_depth),
            signals: SignalChannel::new(network.clone()),
            results: ResultStore::new(),
            state: StateCell::default(),
            last_sweep: Mutex::new(Instant::now()),
            config,
            network,
            directory,
            liveness,
            membership,
            barrier,
            dispatcher,
        });

        master.register_handlers();
        tracing::info!(
            "Compute master {} created for group {} (barrier {})",
            master.id(),
            master.group(),
            master.barrier.id()
        );
        Ok(master)
    }

    pub fn id(&self) -> &NodeId {
        self.network.local_id()
    }

    pub fn group(&self) -> ComputeGroup {
        self.config.group
    }

    pub fn state(&self) -> ComputeState {
        self.state.get()
    }

    /// Queues a task. False, with nothing queued, once the queue is full.
    pub fn submit(&self, task: Task) -> bool {
        self.queue.submit(task)
    }

    /// Queues a payload whose result is kept in [`Self::results`].
    pub fn submit_payload(&self, payload: TaskPayload) -> Result<TaskId> {
        let task = Task::new(payload).with_listener(self.results.clone());
        let task_id = task.id().clone();

        if self.queue.submit(task) {
            Ok(task_id)
        } else {
            Err(ComputeError::QueueFull {
                max: self.queue.max_depth(),
            })
        }
    }

    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn tasks_processed(&self) -> u64 {
        self.dispatcher.tasks_processed()
    }

    /// Joined slaves in rank order.
    pub fn connected_slaves(&self) -> Vec<NodeId> {
        self.membership.members().as_ref().clone()
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.network.register_handler(
            MessageKind::JoinRequest,
            message_handler(move |envelope: Envelope| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    let master = weak.upgrade()?;
                    Some(master.handle_join(envelope.source).await)
                }
            }),
        );

        let weak = Arc::downgrade(self);
        self.network.register_handler(
            MessageKind::Signal,
            message_handler(move |envelope: Envelope| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    if let Message::Signal { code } = envelope.message
                        && let Some(master) = weak.upgrade()
                    {
                        master.handle_signal(&envelope.source, code).await;
                    }
                    None
                }
            }),
        );

        let weak = Arc::downgrade(self);
        self.network.register_handler(
            MessageKind::SubmitTask,
            message_handler(move |envelope: Envelope| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    let master = weak.upgrade()?;
                    match envelope.message {
                        Message::SubmitTask { payload } => {
                            Some(master.handle_submit(envelope.source, payload))
                        }
                        _ => None,
                    }
                }
            }),
        );
    }

    /// Never waits for a running execution: if the membership lock is taken
    /// the slave is told to try again later.
    async fn handle_join(&self, slave: NodeId) -> Message {
        let Some(mut members) = self.membership.try_lock() else {
            tracing::debug!("Join of {} deferred, execution in progress", slave);
            return Message::JoinResponse {
                status: JOIN_TRY_LATER,
                barrier: None,
            };
        };

        if members.contains(&slave) {
            tracing::debug!("Slave {} joined again, ignoring", slave);
        } else {
            members.add(slave.clone());
            // one sign-on per slave plus the master's own
            if let Err(e) = self.barrier.resize_to(members.len() + 1).await {
                tracing::warn!("Growing barrier for {} failed: {}", slave, e);
            }
            tracing::info!(
                "Slave {} joined compute group {} ({} slave(s))",
                slave,
                self.group(),
                members.len()
            );
        }

        Message::JoinResponse {
            status: JOIN_ACCEPTED,
            barrier: Some(self.barrier.id().clone()),
        }
    }

    async fn handle_signal(&self, source: &NodeId, code: u8) {
        match SignalKind::from_code(code) {
            Some(SignalKind::Abort) => {
                let slaves = self.membership.members();
                let delivered = self.signals.broadcast(SignalKind::Abort, &slaves, source).await;
                tracing::info!(
                    "ABORT from {} forwarded to {} slave(s)",
                    source,
                    delivered
                );
            }
            None => tracing::warn!("Ignoring unknown signal {} from {}", code, source),
        }
    }

    fn handle_submit(&self, origin: NodeId, payload: TaskPayload) -> Message {
        let listener = RemoteResultListener::new(self.network.clone(), origin.clone());
        let task = Task::new(payload).with_listener(listener);
        let task_id = task.id().clone();

        let accepted = self.queue.submit(task);
        tracing::debug!(
            "Forwarded task {} from {}: accepted={}",
            task_id,
            origin,
            accepted
        );

        Message::SubmitResponse {
            accepted,
            task_id: accepted.then_some(task_id),
        }
    }

    fn sweep_due(&self) -> bool {
        let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
        if last.elapsed() < self.config.ping_interval() {
            return false;
        }
        *last = Instant::now();
        true
    }
}

#[async_trait]
impl RoleBehavior for ComputeMaster {
    fn role(&self) -> ComputeRole {
        ComputeRole::Master
    }

    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    fn error_die_interval(&self) -> Duration {
        self.config.error_die_interval()
    }

    async fn setup(&self, shutdown: &ShutdownSignal) -> ComputeState {
        let key = master_key(self.group());

        match self.directory.lookup(&key).await {
            Ok(Some(DirectoryEntry::Node(owner))) if owner != *self.id() => {
                let conflict = ComputeError::MasterConflict {
                    group: self.group(),
                    owner,
                };
                tracing::error!("Cannot become master: {}", conflict);
                return ComputeState::ErrorDie;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Master lookup for group {} failed: {}", self.group(), e);
                shutdown.sleep(self.config.join_retry()).await;
                return ComputeState::Setup;
            }
        }

        if let Err(e) = self
            .directory
            .register(&key, DirectoryEntry::Node(self.id().clone()))
            .await
        {
            tracing::warn!("Registering as master of group {} failed: {}", self.group(), e);
            shutdown.sleep(self.config.join_retry()).await;
            return ComputeState::Setup;
        }

        tracing::info!("Registered as master of compute group {}", self.group());
        ComputeState::Idle
    }

    async fn idle(&self, shutdown: &ShutdownSignal) -> ComputeState {
        if !self.queue.is_empty() {
            if !self.membership.is_empty() {
                return ComputeState::Execute;
            }

            tracing::debug!("{} task(s) queued, no slaves joined yet", self.depth());
            shutdown.sleep(self.config.no_slave_backoff()).await;
            return ComputeState::Idle;
        }

        if self.sweep_due() {
            self.membership.reconcile(self.liveness.as_ref()).await;
        }

        shutdown.sleep(self.config.idle_poll()).await;
        ComputeState::Idle
    }

    async fn execute(&self, shutdown: &ShutdownSignal) -> ComputeState {
        if let Some(task) = self.queue.dequeue() {
            self.dispatcher.dispatch(task, shutdown).await;
        }
        ComputeState::Idle
    }

    async fn on_terminate(&self) {
        let key = master_key(self.group());

        // only invalidate an entry that still names this node
        match self.directory.lookup(&key).await {
            Ok(Some(DirectoryEntry::Node(owner))) if owner == *self.id() => {
                match self.directory.register(&key, DirectoryEntry::Invalid).await {
                    Ok(()) => tracing::info!("Master entry of group {} invalidated", self.group()),
                    Err(e) => tracing::warn!("Invalidating master entry failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Master lookup on shutdown failed: {}", e),
        }
    }
}
