//! Membership registry of a master
//!
//! Ordered set of joined slaves. Join order is execution rank order. Every
//! mutation goes through [`MembershipGuard`], obtained from the one lock the
//! registry owns; the dispatcher keeps that guard for a whole execution so
//! no slave can join mid-dispatch.
//!
//! Network callbacks must never wait for an execution to finish, so they use
//! [`MembershipRegistry::try_lock`] and [`MembershipRegistry::members`], the
//! latter being the last published copy of the list.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::cluster::Liveness;
use crate::cluster::types::NodeId;

pub struct MembershipRegistry {
    slaves: Mutex<Vec<NodeId>>,
    published: watch::Sender<Arc<Vec<NodeId>>>,
}

impl Default for MembershipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipRegistry {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            slaves: Mutex::new(Vec::new()),
            published,
        }
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_lock(&self) -> Option<MembershipGuard<'_>> {
        self.slaves.try_lock().ok().map(|slaves| MembershipGuard {
            slaves,
            published: &self.published,
        })
    }

    /// Waits for exclusive access to the slave list.
    ///
    /// Held by a dispatch for its whole duration, so joins arriving meanwhile
    /// see [`try_lock`](Self::try_lock) fail and are told to retry.
    ///
    /// # Returns
    /// A guard that publishes its changes when [`MembershipGuard::publish`] is called
    pub async fn lock(&self) -> MembershipGuard<'_> {
        MembershipGuard {
            slaves: self.slaves.lock().await,
            published: &self.published,
        }
    }

    /// Last published membership. Never blocks, may lag a running mutation.
    pub fn members(&self) -> Arc<Vec<NodeId>> {
        self.published.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.published.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes `id` if present.
    pub async fn remove(&self, id: &NodeId) -> bool {
        self.lock().await.remove(id)
    }

    /// Drops every slave the liveness facility no longer reports online and
    /// returns the ones that remain.
    pub async fn reconcile(&self, liveness: &dyn Liveness) -> Vec<NodeId> {
        let online = liveness.online_node_ids();
        let mut guard = self.lock().await;

        for gone in guard.retain_online(&online) {
            tracing::info!("Slave {} is not available anymore, removing", gone);
        }
        tracing::trace!("Liveness sweep: {} slave(s) online", guard.len());

        guard.snapshot()
    }
}

pub struct MembershipGuard<'a> {
    slaves: MutexGuard<'a, Vec<NodeId>>,
    published: &'a watch::Sender<Arc<Vec<NodeId>>>,
}

impl MembershipGuard<'_> {
    pub fn contains(&self, id: &NodeId) -> bool {
        self.slaves.contains(id)
    }

    /// Appends `id`. Returns false, changing nothing, if it is already a member.
    pub fn add(&mut self, id: NodeId) -> bool {
        if self.slaves.contains(&id) {
            return false;
        }
        self.slaves.push(id);
        self.publish();
        true
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let before = self.slaves.len();
        self.slaves.retain(|slave| slave != id);

        let removed = self.slaves.len() != before;
        if removed {
            self.publish();
        }
        removed
    }

    /// Keeps only slaves present in `online`; returns the removed ones.
    pub fn retain_online(&mut self, online: &HashSet<NodeId>) -> Vec<NodeId> {
        let (kept, gone): (Vec<NodeId>, Vec<NodeId>) =
            self.slaves.drain(..).partition(|slave| online.contains(slave));
        *self.slaves = kept;

        if !gone.is_empty() {
            self.publish();
        }
        gone
    }

    /// Ordered copy of the current membership.
    pub fn snapshot(&self) -> Vec<NodeId> {
        self.slaves.clone()
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    fn publish(&self) {
        self.published.send_replace(Arc::new(self.slaves.clone()));
    }
}
