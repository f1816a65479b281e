//! Barrier adapter
//!
//! Wraps the group barrier handle the master owns and translates the
//! scheduler's needs (allocate for N, resize to N, sign on and collect) into
//! [`BarrierService`] calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::types::{ComputeGroup, RESULT_INCONCLUSIVE};
use crate::cluster::types::NodeId;
use crate::error::BarrierError;
use crate::sync::BarrierService;
use crate::sync::types::{BarrierId, BarrierStatus};

pub struct BarrierAdapter {
    service: Arc<dyn BarrierService>,
    id: BarrierId,
    size: AtomicUsize,
}

impl BarrierAdapter {
    /// Allocates a barrier for `signers` participants.
    pub async fn allocate_for(
        service: Arc<dyn BarrierService>,
        signers: usize,
    ) -> Result<Self, BarrierError> {
        let id = service.allocate(signers).await?;
        Ok(Self {
            service,
            id,
            size: AtomicUsize::new(signers),
        })
    }

    pub fn id(&self) -> &BarrierId {
        &self.id
    }

    /// Last size requested through this adapter.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Sets the number of signers the next round waits for.
    ///
    /// # Arguments
    /// * `signers` - Required signers, the master included
    ///
    /// # Returns
    /// * `Ok(())` - Barrier resized, or already at that size
    /// * `Err(BarrierError)` - The barrier service refused; the recorded size is unchanged
    pub async fn resize_to(&self, signers: usize) -> Result<(), BarrierError> {
        if self.size() == signers {
            return Ok(());
        }

        self.service.resize(&self.id, signers).await?;
        self.size.store(signers, Ordering::SeqCst);
        tracing::trace!("Barrier {} resized to {}", self.id, signers);
        Ok(())
    }

    /// Signs on and waits for the round. `Ok(None)` if the round never completed.
    pub async fn sign_on_and_collect(
        &self,
        data: i64,
        timeout: Option<Duration>,
    ) -> Result<Option<BarrierStatus>, BarrierError> {
        self.service.sign_on(&self.id, data, timeout).await
    }
}

/// Reorders the codes of a completed round to follow `slaves`. A slave with
/// no sign-on in the round gets [`RESULT_INCONCLUSIVE`].
pub fn align_results(status: &BarrierStatus, slaves: &[NodeId]) -> Vec<i32> {
    slaves
        .iter()
        .map(|slave| {
            status
                .data_of(slave)
                .and_then(|code| i32::try_from(code).ok())
                .unwrap_or(RESULT_INCONCLUSIVE)
        })
        .collect()
}

/// Barrier tag for the execution after `previous`. Alternates between two
/// values per group; groups never share a tag.
pub fn next_barrier_tag(previous: u32, group: ComputeGroup) -> u32 {
    (previous + 1) % 2 + u32::from(group) * 2
}
