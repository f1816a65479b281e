//! Execution Dispatcher
//!
//! Runs one task on the current slave set of a master:
//!
//! 1. Drop tasks without a payload.
//! 2. Wait until enough slaves joined if the payload asks for an exact count,
//!    re-checking liveness on every poll.
//! 3. Freeze membership (hold its lock for the rest of the cycle) and take
//!    the ordered snapshot that defines ranks and result order.
//! 4. Send the payload to every slave in snapshot order. Unreachable slaves
//!    are removed from membership; slaves that decline stay members but do
//!    not take part in the rendezvous.
//! 5. Rendezvous on the group barrier with every participating slave, each
//!    handing in its result code.
//! 6. Report codes in snapshot order to the task's listeners.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::barrier::{BarrierAdapter, align_results, next_barrier_tag};
use super::membership::MembershipRegistry;
use super::node::ShutdownSignal;
use super::task::Task;
use super::types::{
    ComputeGroup, RESULT_SYNC_FAILED, RequiredSlaves, STATUS_OK, TaskContextData, TaskPayload,
};
use crate::cluster::Liveness;
use crate::cluster::types::NodeId;
use crate::net::Network;
use crate::net::protocol::Message;
use crate::sync::types::BarrierStatus;

/// Custom data the master hands in at the rendezvous.
const MASTER_SIGN_ON_DATA: i64 = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The task had no payload and was dropped.
    Malformed,
    /// Shutdown arrived while waiting for a quorum; the task never ran.
    Abandoned,
    /// Result codes, one per slave the task was dispatched to.
    Completed(Vec<i32>),
}

pub struct ExecutionDispatcher {
    group: ComputeGroup,
    network: Arc<dyn Network>,
    liveness: Arc<dyn Liveness>,
    membership: Arc<MembershipRegistry>,
    barrier: Arc<BarrierAdapter>,
    quorum_poll: Duration,
    last_tag: AtomicU32,
    processed: AtomicU64,
}

impl ExecutionDispatcher {
    /// Creates the dispatcher of a master.
    ///
    /// # Arguments
    /// * `group` - Compute group; fixes the pair of barrier tags used
    /// * `network` - Transport used for execute requests
    /// * `liveness` - Online query used while waiting for a quorum
    /// * `membership` - The master's slave list
    /// * `barrier` - Rendezvous barrier owned by the master
    /// * `quorum_poll` - Pause between quorum checks
    pub fn new(
        group: ComputeGroup,
        network: Arc<dyn Network>,
        liveness: Arc<dyn Liveness>,
        membership: Arc<MembershipRegistry>,
        barrier: Arc<BarrierAdapter>,
        quorum_poll: Duration,
    ) -> Self {
        Self {
            group,
            network,
            liveness,
            membership,
            barrier,
            quorum_poll,
            last_tag: AtomicU32::new(u32::from(group) * 2 + 1),
            processed: AtomicU64::new(0),
        }
    }

    pub fn tasks_processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Runs one task on the current slaves and waits for their results.
    ///
    /// Holds the membership lock from the snapshot until listeners have
    /// been told the outcome. Slaves that cannot be reached are removed
    /// from membership; slaves that decline keep their place and report
    /// `RESULT_INCONCLUSIVE`.
    ///
    /// # Arguments
    /// * `task` - Dequeued task, consumed
    /// * `shutdown` - Ends a pending quorum wait
    ///
    /// # Returns
    /// * `DispatchOutcome::Completed(codes)` - Listeners got `codes`, one per participating slave in rank order
    /// * `DispatchOutcome::Malformed` - The task had no payload
    /// * `DispatchOutcome::Abandoned` - Shutdown arrived before the quorum was met
    pub async fn dispatch(&self, task: Task, shutdown: &ShutdownSignal) -> DispatchOutcome {
        let Some(payload) = task.payload().cloned() else {
            tracing::error!("Task {} has no payload, dropping it", task.id());
            return DispatchOutcome::Malformed;
        };

        if let RequiredSlaves::Exact(required) = payload.required_slaves
            && !self.wait_for_quorum(required, shutdown).await
        {
            tracing::warn!("Shutdown while task {} waited for slaves, abandoning it", task.id());
            return DispatchOutcome::Abandoned;
        }

        let mut members = self.membership.lock().await;
        let snapshot = members.snapshot();
        task.notify_started();

        let tag = self.next_tag();
        tracing::info!(
            "Executing task {} ({}) on {} slave(s), barrier tag {}",
            task.id(),
            payload.kind,
            snapshot.len(),
            tag
        );

        let mut slaves = Vec::with_capacity(snapshot.len());
        let mut participating = 0;

        for (rank, slave) in snapshot.iter().enumerate() {
            match self.send_execute(slave, rank, &snapshot, tag, &payload).await {
                SlaveReply::Accepted => {
                    participating += 1;
                    slaves.push(slave.clone());
                }
                SlaveReply::Declined => slaves.push(slave.clone()),
                SlaveReply::Unreachable => {
                    members.remove(slave);
                }
            }
        }

        let codes = match self.rendezvous(participating).await {
            Some(status) => align_results(&status, &slaves),
            None => vec![RESULT_SYNC_FAILED; slaves.len()],
        };

        if let Err(e) = self.barrier.resize_to(members.len() + 1).await {
            tracing::warn!("Restoring barrier size failed: {}", e);
        }

        self.processed.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Task {} finished: {:?}", task.id(), codes);
        task.notify_completed(&codes);

        drop(members);
        DispatchOutcome::Completed(codes)
    }

    /// Polls membership until `required` slaves are online. False on shutdown.
    async fn wait_for_quorum(&self, required: usize, shutdown: &ShutdownSignal) -> bool {
        loop {
            let online = self.membership.reconcile(self.liveness.as_ref()).await;
            if online.len() >= required {
                return true;
            }

            tracing::info!(
                "Waiting for slaves: {} of {} joined",
                online.len(),
                required
            );
            if !shutdown.sleep(self.quorum_poll).await {
                return false;
            }
        }
    }

    async fn send_execute(
        &self,
        slave: &NodeId,
        rank: usize,
        snapshot: &[NodeId],
        tag: u32,
        payload: &TaskPayload,
    ) -> SlaveReply {
        let request = Message::ExecuteRequest {
            barrier_tag: tag,
            context: TaskContextData {
                group: self.group,
                rank,
                slaves: snapshot.to_vec(),
            },
            payload: payload.clone(),
        };

        match self.network.send_and_wait(slave, request).await {
            Ok(Message::ExecuteResponse { status: STATUS_OK }) => SlaveReply::Accepted,
            Ok(Message::ExecuteResponse { status }) => {
                tracing::warn!("Slave {} declined execution with status {}", slave, status);
                SlaveReply::Declined
            }
            Ok(other) => {
                tracing::warn!(
                    "Slave {} answered execute request with {}",
                    slave,
                    other.kind()
                );
                SlaveReply::Declined
            }
            Err(e) if e.is_unreachable() => {
                tracing::error!("Sending task to slave {} failed, removing: {}", slave, e);
                SlaveReply::Unreachable
            }
            Err(e) => {
                tracing::warn!("Slave {} could not take the task: {}", slave, e);
                SlaveReply::Declined
            }
        }
    }

    /// Waits for `participating` slaves plus the master itself.
    async fn rendezvous(&self, participating: usize) -> Option<BarrierStatus> {
        if let Err(e) = self.barrier.resize_to(participating + 1).await {
            tracing::error!("Resizing barrier for rendezvous failed: {}", e);
            return None;
        }

        match self
            .barrier
            .sign_on_and_collect(MASTER_SIGN_ON_DATA, None)
            .await
        {
            Ok(Some(status)) => Some(status),
            Ok(None) => {
                tracing::error!("Rendezvous of {} slave(s) timed out", participating);
                None
            }
            Err(e) => {
                tracing::error!("Rendezvous failed: {}", e);
                None
            }
        }
    }

    fn next_tag(&self) -> u32 {
        let previous = self.last_tag.load(Ordering::SeqCst);
        let tag = next_barrier_tag(previous, self.group);
        self.last_tag.store(tag, Ordering::SeqCst);
        tag
    }
}

enum SlaveReply {
    Accepted,
    Declined,
    Unreachable,
}
