use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::types::NodeId;

/// Identifies a barrier. The owner hosts its state; everyone else signs on remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BarrierId {
    pub owner: NodeId,
    pub index: u32,
}

impl fmt::Display for BarrierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.index)
    }
}

/// Outcome of a completed barrier round: who signed on, and what each passed along.
/// `data[i]` belongs to `signers[i]`; order is arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BarrierStatus {
    pub signers: Vec<NodeId>,
    pub data: Vec<i64>,
}

impl BarrierStatus {
    pub fn data_of(&self, signer: &NodeId) -> Option<i64> {
        self.signers
            .iter()
            .position(|id| id == signer)
            .map(|idx| self.data[idx])
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignOnRequest {
    pub barrier: BarrierId,
    pub signer: NodeId,
    pub data: i64,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub barrier: BarrierId,
    pub size: usize,
}
