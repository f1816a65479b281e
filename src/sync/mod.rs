//! Barrier Synchronization
//!
//! [`BarrierService`] is the barrier facility compute masters and slaves
//! consume: allocate a barrier for N signers, resize it, and sign on with a
//! piece of custom data, getting back every signer's data once the round
//! completes.
//!
//! - **`table`**: the barrier engine, one per owning node.
//! - **`LocalBarrierService`**: signs on directly against a shared table (in-process clusters, tests).
//! - **`http`**: forwards sign-ons for barriers owned by other nodes over HTTP.

pub mod http;
pub mod table;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::types::NodeId;
use crate::error::BarrierError;
use table::BarrierTable;
use types::{BarrierId, BarrierStatus};

#[async_trait]
pub trait BarrierService: Send + Sync {
    async fn allocate(&self, size: usize) -> Result<BarrierId, BarrierError>;

    async fn resize(&self, barrier: &BarrierId, size: usize) -> Result<(), BarrierError>;

    /// Blocks until the round completes. `Ok(None)` on timeout.
    async fn sign_on(
        &self,
        barrier: &BarrierId,
        data: i64,
        timeout: Option<Duration>,
    ) -> Result<Option<BarrierStatus>, BarrierError>;
}

/// A node's view of a barrier table living in the same process.
pub struct LocalBarrierService {
    node: NodeId,
    table: Arc<BarrierTable>,
}

impl LocalBarrierService {
    pub fn new(node: NodeId, table: Arc<BarrierTable>) -> Arc<Self> {
        Arc::new(Self { node, table })
    }
}

#[async_trait]
impl BarrierService for LocalBarrierService {
    async fn allocate(&self, size: usize) -> Result<BarrierId, BarrierError> {
        Ok(self.table.allocate(size))
    }

    async fn resize(&self, barrier: &BarrierId, size: usize) -> Result<(), BarrierError> {
        self.table.resize(barrier, size)
    }

    async fn sign_on(
        &self,
        barrier: &BarrierId,
        data: i64,
        timeout: Option<Duration>,
    ) -> Result<Option<BarrierStatus>, BarrierError> {
        self.table
            .sign_on(barrier, self.node.clone(), data, timeout)
            .await
    }
}
