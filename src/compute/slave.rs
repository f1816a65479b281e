//! Slave role
//!
//! A slave finds its group's master through the directory, joins it, and
//! then only reacts: execute requests run a registered payload in the
//! background and sign on to the master's barrier with the result code.
//! One execution at a time; a request arriving while one runs is declined.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::node::{RoleBehavior, ShutdownSignal, StateCell};
use super::payloads::{AbortSignal, PayloadRegistry, TaskScope};
use super::signal::{SignalChannel, SignalKind};
use super::task::{ResultStore, TaskListener};
use super::types::{
    ComputeGroup, ComputeRole, ComputeState, JOIN_ACCEPTED, RESULT_INCONCLUSIVE, STATUS_BUSY,
    STATUS_NOT_JOINED, STATUS_OK, STATUS_UNKNOWN_PAYLOAD, TaskContextData, TaskId, TaskPayload,
};
use crate::cluster::Liveness;
use crate::cluster::types::NodeId;
use crate::config::ComputeConfig;
use crate::directory::{Directory, DirectoryEntry, master_key};
use crate::error::{ComputeError, NetworkError, Result};
use crate::net::Network;
use crate::net::protocol::{Envelope, Message, MessageKind};
use crate::net::registry::message_handler;
use crate::sync::BarrierService;
use crate::sync::types::BarrierId;

/// The master this slave is joined to.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedMaster {
    pub id: NodeId,
    pub barrier: BarrierId,
}

struct RunningExecution {
    tag: u32,
    abort: AbortSignal,
}

pub struct ComputeSlave {
    config: ComputeConfig,
    network: Arc<dyn Network>,
    barriers: Arc<dyn BarrierService>,
    directory: Arc<dyn Directory>,
    liveness: Arc<dyn Liveness>,
    payloads: Arc<PayloadRegistry>,
    signals: SignalChannel,
    results: Arc<ResultStore>,
    state: StateCell,
    master: RwLock<Option<JoinedMaster>>,
    running: Mutex<Option<RunningExecution>>,
}

impl ComputeSlave {
    /// Creates a slave and registers its message handlers.
    ///
    /// # Arguments
    /// * `config` - Timing and group settings; validated here
    /// * `payloads` - Payload kinds this slave can run
    ///
    /// # Returns
    /// * `Ok(slave)` - Ready to be driven by [`ComputeNode::start`](super::node::ComputeNode::start)
    /// * `Err(ComputeError::InvalidConfig)` - The configuration failed validation
    pub fn new(
        config: ComputeConfig,
        network: Arc<dyn Network>,
        barriers: Arc<dyn BarrierService>,
        directory: Arc<dyn Directory>,
        liveness: Arc<dyn Liveness>,
        payloads: Arc<PayloadRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let slave = Arc::new(Self {
            signals: SignalChannel::new(network.clone()),
            results: ResultStore::new(),
            state: StateCell::default(),
            master: RwLock::new(None),
            running: Mutex::new(None),
            config,
            network,
            barriers,
            directory,
            liveness,
            payloads,
        });

        slave.register_handlers();
        tracing::info!(
            "Compute slave {} created for group {} (payloads: {:?})",
            slave.id(),
            slave.group(),
            slave.payloads.list()
        );
        Ok(slave)
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

    pub async fn master(&self) -> Option<JoinedMaster> {
        self.master.read().await.clone()
    }

    pub async fn is_executing(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Forwards a payload to the master's queue. The result shows up in
    /// [`Self::results`] once the master reports back.
    pub async fn submit(&self, payload: TaskPayload) -> Result<TaskId> {
        let master = self.master().await.ok_or(ComputeError::NotJoined)?;

        match self
            .network
            .send_and_wait(&master.id, Message::SubmitTask { payload })
            .await?
        {
            Message::SubmitResponse {
                accepted: true,
                task_id: Some(task_id),
            } => {
                self.results.execution_started(&task_id);
                Ok(task_id)
            }
            Message::SubmitResponse { .. } => Err(ComputeError::Rejected(master.id)),
            _ => Err(NetworkError::UnexpectedResponse {
                target: master.id,
                expected: MessageKind::SubmitResponse.to_string(),
            }
            .into()),
        }
    }

    /// Asks the master to abort the running execution on every slave.
    pub async fn signal_abort(&self) -> Result<()> {
        let master = self.master().await.ok_or(ComputeError::NotJoined)?;
        self.signals.signal(SignalKind::Abort, &master.id).await?;
        Ok(())
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.network.register_handler(
            MessageKind::ExecuteRequest,
            message_handler(move |envelope: Envelope| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    let slave = weak.upgrade()?;
                    match envelope.message {
                        Message::ExecuteRequest {
                            barrier_tag,
                            context,
                            payload,
                        } => Some(
                            slave
                                .handle_execute(&envelope.source, barrier_tag, context, payload)
                                .await,
                        ),
                        _ => None,
                    }
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
                        && let Some(slave) = weak.upgrade()
                    {
                        slave.handle_signal(&envelope.source, code).await;
                    }
                    None
                }
            }),
        );

        let weak = Arc::downgrade(self);
        self.network.register_handler(
            MessageKind::TaskFinished,
            message_handler(move |envelope: Envelope| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    if let Message::TaskFinished { task_id, codes } = envelope.message
                        && let Some(slave) = weak.upgrade()
                    {
                        tracing::debug!("Task {} finished: {:?}", task_id, codes);
                        slave.results.record_completed(&task_id, codes);
                    }
                    None
                }
            }),
        );
    }

    async fn handle_execute(
        self: &Arc<Self>,
        source: &NodeId,
        barrier_tag: u32,
        context: TaskContextData,
        payload: TaskPayload,
    ) -> Message {
        let joined = match self.master().await {
            Some(master) if master.id == *source => master,
            _ => {
                tracing::warn!("Execute request from {}, which is not our master", source);
                return Message::ExecuteResponse {
                    status: STATUS_NOT_JOINED,
                };
            }
        };

        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            tracing::warn!(
                "Still executing tag {}, declining tag {}",
                current.tag,
                barrier_tag
            );
            return Message::ExecuteResponse {
                status: STATUS_BUSY,
            };
        }

        if !self.payloads.has(&payload.kind) {
            tracing::error!("Unknown payload '{}', declining", payload.kind);
            return Message::ExecuteResponse {
                status: STATUS_UNKNOWN_PAYLOAD,
            };
        }

        let abort = AbortSignal::new();
        *running = Some(RunningExecution {
            tag: barrier_tag,
            abort: abort.clone(),
        });
        drop(running);

        let slave = self.clone();
        tokio::spawn(async move {
            slave
                .run_execution(joined.barrier, barrier_tag, context, payload, abort)
                .await;
        });

        Message::ExecuteResponse { status: STATUS_OK }
    }

    async fn run_execution(
        &self,
        barrier: BarrierId,
        tag: u32,
        context: TaskContextData,
        payload: TaskPayload,
        abort: AbortSignal,
    ) {
        let rank = context.rank;
        let scope = TaskScope {
            context,
            params: payload.params,
            abort,
        };

        let code = self
            .payloads
            .execute(&payload.kind, scope)
            .await
            .unwrap_or(RESULT_INCONCLUSIVE);
        tracing::info!(
            "Payload '{}' finished as rank {} with code {}",
            payload.kind,
            rank,
            code
        );

        match self.barriers.sign_on(&barrier, i64::from(code), None).await {
            Ok(Some(_)) => tracing::debug!("Rendezvous for tag {} complete", tag),
            Ok(None) => tracing::warn!("Rendezvous for tag {} timed out", tag),
            Err(e) => tracing::error!("Signing on barrier {} failed: {}", barrier, e),
        }

        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|current| current.tag == tag) {
            *running = None;
        }
    }

    async fn handle_signal(&self, source: &NodeId, code: u8) {
        match SignalKind::from_code(code) {
            Some(SignalKind::Abort) => match self.running.lock().await.as_ref() {
                Some(current) => {
                    tracing::info!("ABORT from {}, aborting tag {}", source, current.tag);
                    current.abort.trip();
                }
                None => tracing::debug!("ABORT from {} with nothing running", source),
            },
            None => tracing::warn!("Ignoring unknown signal {} from {}", code, source),
        }
    }
}

#[async_trait]
impl RoleBehavior for ComputeSlave {
    fn role(&self) -> ComputeRole {
        ComputeRole::Slave
    }

    fn state_cell(&self) -> &StateCell {
        &self.state
    }

    fn error_die_interval(&self) -> Duration {
        self.config.error_die_interval()
    }

    async fn setup(&self, shutdown: &ShutdownSignal) -> ComputeState {
        let master = match self.directory.lookup(&master_key(self.group())).await {
            Ok(Some(DirectoryEntry::Node(master))) => master,
            Ok(_) => {
                tracing::debug!("No master for compute group {} yet", self.group());
                shutdown.sleep(self.config.join_retry()).await;
                return ComputeState::Setup;
            }
            Err(e) => {
                tracing::warn!("Master lookup for group {} failed: {}", self.group(), e);
                shutdown.sleep(self.config.join_retry()).await;
                return ComputeState::Setup;
            }
        };

        // held across the request: an execute request racing the join response
        // waits here instead of being declined
        let mut joined = self.master.write().await;

        match self.network.send_and_wait(&master, Message::JoinRequest).await {
            Ok(Message::JoinResponse {
                status: JOIN_ACCEPTED,
                barrier: Some(barrier),
            }) => {
                tracing::info!("Joined master {} of compute group {}", master, self.group());
                *joined = Some(JoinedMaster {
                    id: master,
                    barrier,
                });
                return ComputeState::Idle;
            }
            Ok(Message::JoinResponse { status, .. }) => {
                tracing::debug!("Master {} asked to join later (status {})", master, status);
            }
            Ok(other) => {
                tracing::warn!("Master {} answered join with {}", master, other.kind());
            }
            Err(e) => tracing::warn!("Joining master {} failed: {}", master, e),
        }
        drop(joined);

        shutdown.sleep(self.config.join_retry()).await;
        ComputeState::Setup
    }

    async fn idle(&self, shutdown: &ShutdownSignal) -> ComputeState {
        if !shutdown.sleep(self.config.ping_interval()).await {
            return ComputeState::Idle;
        }

        let Some(master) = self.master().await else {
            return ComputeState::Setup;
        };

        if !self.liveness.is_online(&master.id) {
            tracing::warn!("Master {} is gone, looking for a new one", master.id);
            *self.master.write().await = None;
            return ComputeState::Setup;
        }
        ComputeState::Idle
    }

    async fn execute(&self, _shutdown: &ShutdownSignal) -> ComputeState {
        // slaves execute from their request handler
        ComputeState::Idle
    }

    async fn on_terminate(&self) {
        if let Some(current) = self.running.lock().await.as_ref() {
            tracing::info!("Aborting tag {} on shutdown", current.tag);
            current.abort.trip();
        }
    }
}
