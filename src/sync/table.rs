//! Barrier engine
//!
//! Holds every barrier owned by one node. A barrier of size N releases as soon
//! as N distinct signers are waiting; all of them receive the same
//! [`BarrierStatus`]. The barrier then resets and can be reused for the next
//! round (generation).

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use super::types::{BarrierId, BarrierStatus};
use crate::cluster::types::NodeId;
use crate::error::BarrierError;

/// Completed rounds kept around for late readers.
const RETAINED_ROUNDS: usize = 4;

struct BarrierSlot {
    size: usize,
    generation: u64,
    signed: Vec<(NodeId, i64)>,
    results: BTreeMap<u64, Arc<BarrierStatus>>,
    /// Number of completed generations.
    completed: watch::Sender<u64>,
}

impl BarrierSlot {
    fn release(&mut self) -> Arc<BarrierStatus> {
        let (signers, data) = self.signed.drain(..).unzip();
        let status = Arc::new(BarrierStatus { signers, data });

        self.results.insert(self.generation, status.clone());
        while self.results.len() > RETAINED_ROUNDS {
            self.results.pop_first();
        }

        self.generation += 1;
        self.completed.send_replace(self.generation);
        status
    }
}

pub struct BarrierTable {
    owner: NodeId,
    next_index: AtomicU32,
    barriers: DashMap<u32, BarrierSlot>,
    /// Applied to sign-ons that do not bring their own timeout.
    max_wait: Option<Duration>,
}

impl BarrierTable {
    /// `max_wait` bounds sign-ons that come without their own timeout.
    pub fn new(owner: NodeId, max_wait: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            next_index: AtomicU32::new(0),
            barriers: DashMap::new(),
            max_wait,
        })
    }

    pub fn owner(&self) -> &NodeId {
        &self.owner
    }

    /// Creates a barrier owned by this node.
    ///
    /// # Arguments
    /// * `size` - Signers required to complete a round
    ///
    /// # Returns
    /// The id other nodes use to sign on through the owner
    pub fn allocate(&self, size: usize) -> BarrierId {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let (completed, _) = watch::channel(0);

        self.barriers.insert(
            index,
            BarrierSlot {
                size,
                generation: 0,
                signed: Vec::new(),
                results: BTreeMap::new(),
                completed,
            },
        );

        let id = BarrierId {
            owner: self.owner.clone(),
            index,
        };
        tracing::debug!("Allocated barrier {} for {} signer(s)", id, size);
        id
    }

    /// Changes the required signer count. Shrinking below the number already
    /// waiting releases them immediately.
    pub fn resize(&self, id: &BarrierId, size: usize) -> Result<(), BarrierError> {
        let mut slot = self.slot_mut(id)?;
        slot.size = size;

        if !slot.signed.is_empty() && slot.signed.len() >= size {
            tracing::debug!("Barrier {} released by resize to {}", id, size);
            slot.release();
        }
        Ok(())
    }

    pub fn size(&self, id: &BarrierId) -> Option<usize> {
        self.barriers.get(&id.index).map(|slot| slot.size)
    }

    /// Signers currently waiting in the open round.
    pub fn waiting(&self, id: &BarrierId) -> usize {
        self.barriers
            .get(&id.index)
            .map(|slot| slot.signed.len())
            .unwrap_or(0)
    }

    /// Blocks until the round completes. `Ok(None)` means the wait timed out
    /// and the signer was withdrawn from the round.
    pub async fn sign_on(
        &self,
        id: &BarrierId,
        signer: NodeId,
        data: i64,
        timeout: Option<Duration>,
    ) -> Result<Option<BarrierStatus>, BarrierError> {
        let (mut completed, generation) = {
            let mut slot = self.slot_mut(id)?;

            match slot.signed.iter().position(|(who, _)| *who == signer) {
                Some(idx) => slot.signed[idx].1 = data,
                None => slot.signed.push((signer.clone(), data)),
            }

            if slot.signed.len() >= slot.size {
                tracing::trace!("Barrier {} complete on sign-on of {}", id, signer);
                return Ok(Some(slot.release().as_ref().clone()));
            }

            (slot.completed.subscribe(), slot.generation)
        };

        // the watch borrow must not outlive this future: release() takes the slot, then the watch
        let wait = async {
            completed
                .wait_for(|done| *done > generation)
                .await
                .map(|_| ())
        };
        let outcome = match timeout.or(self.max_wait) {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
            None => Some(wait.await),
        };

        match outcome {
            Some(Ok(_)) => {
                let slot = self.slot_mut(id)?;
                Ok(slot.results.get(&generation).map(|status| status.as_ref().clone()))
            }
            Some(Err(_)) => Err(BarrierError::UnknownBarrier(id.to_string())),
            None => {
                let mut slot = self.slot_mut(id)?;
                if slot.generation == generation {
                    slot.signed.retain(|(who, _)| *who != signer);
                    tracing::debug!("Sign-on of {} to barrier {} timed out", signer, id);
                    Ok(None)
                } else {
                    // released between the timeout firing and us taking the slot
                    Ok(slot.results.get(&generation).map(|status| status.as_ref().clone()))
                }
            }
        }
    }

    fn slot_mut(
        &self,
        id: &BarrierId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, u32, BarrierSlot>, BarrierError> {
        if id.owner != self.owner {
            return Err(BarrierError::UnknownBarrier(id.to_string()));
        }
        self.barriers
            .get_mut(&id.index)
            .ok_or_else(|| BarrierError::UnknownBarrier(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::from(name)
    }

    #[tokio::test]
    async fn test_single_signer_barrier_releases_immediately() {
        let table = BarrierTable::new(node("host"), None);
        let id = table.allocate(1);

        let status = table.sign_on(&id, node("a"), 7, None).await.unwrap().unwrap();

        assert_eq!(status.signers, vec![node("a")]);
        assert_eq!(status.data, vec![7]);
        assert_eq!(table.waiting(&id), 0);
    }

    #[tokio::test]
    async fn test_all_signers_receive_same_status() {
        let table = BarrierTable::new(node("host"), None);
        let id = table.allocate(3);

        let mut handles = Vec::new();
        for (name, data) in [("a", 1), ("b", 2)] {
            let table = table.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                table.sign_on(&id, node(name), data, None).await
            }));
        }

        while table.waiting(&id) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let last = table.sign_on(&id, node("c"), 3, None).await.unwrap().unwrap();
        assert_eq!(last.signers.len(), 3);

        for handle in handles {
            let status = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(status, last);
        }
        assert_eq!(last.data_of(&node("b")), Some(2));
    }

    #[tokio::test]
    async fn test_sign_on_timeout_withdraws_signer() {
        let table = BarrierTable::new(node("host"), None);
        let id = table.allocate(2);

        let outcome = table
            .sign_on(&id, node("a"), 1, Some(Duration::from_millis(20)))
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(table.waiting(&id), 0);
    }

    #[tokio::test]
    async fn test_max_wait_applies_without_caller_timeout() {
        let table = BarrierTable::new(node("host"), Some(Duration::from_millis(20)));
        let id = table.allocate(2);

        let outcome = table.sign_on(&id, node("a"), 1, None).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_resize_below_waiting_releases() {
        let table = BarrierTable::new(node("host"), None);
        let id = table.allocate(3);

        let waiter = {
            let table = table.clone();
            let id = id.clone();
            tokio::spawn(async move { table.sign_on(&id, node("a"), 9, None).await })
        };
        while table.waiting(&id) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        table.resize(&id, 1).unwrap();

        let status = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(status.signers, vec![node("a")]);
        assert_eq!(table.size(&id), Some(1));
    }

    #[tokio::test]
    async fn test_barrier_is_reusable_across_rounds() {
        let table = BarrierTable::new(node("host"), None);
        let id = table.allocate(1);

        let first = table.sign_on(&id, node("a"), 1, None).await.unwrap().unwrap();
        let second = table.sign_on(&id, node("a"), 2, None).await.unwrap().unwrap();

        assert_eq!(first.data, vec![1]);
        assert_eq!(second.data, vec![2]);
    }

    #[tokio::test]
    async fn test_foreign_barrier_is_unknown() {
        let table = BarrierTable::new(node("host"), None);
        let foreign = BarrierId {
            owner: node("other"),
            index: 0,
        };

        assert!(table.resize(&foreign, 2).is_err());
        assert!(table.sign_on(&foreign, node("a"), 0, None).await.is_err());
    }
}
