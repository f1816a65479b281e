//! Cluster Membership & Liveness
//!
//! Answers "which nodes are online right now" and "where does node X listen".
//! Compute groups sit on top of this; they never track liveness themselves.
//!
//! The networked implementation is a small UDP gossip protocol (SWIM-like):
//! peers ping each other, unanswered peers become `Suspect` and then `Dead`,
//! and a suspected peer refutes the claim by bumping its incarnation.

pub mod gossip;
pub mod types;

use std::collections::HashSet;
use std::net::SocketAddr;

use types::NodeId;

/// Cluster-wide online query consumed by compute masters and slaves.
pub trait Liveness: Send + Sync {
    fn online_node_ids(&self) -> HashSet<NodeId>;

    fn is_online(&self, id: &NodeId) -> bool {
        self.online_node_ids().contains(id)
    }
}

/// Maps a node identity to the address of its HTTP endpoint.
pub trait PeerResolver: Send + Sync {
    fn http_addr(&self, id: &NodeId) -> Option<SocketAddr>;
}
