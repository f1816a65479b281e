use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Network-unique identity of a cluster node, stable for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// First eight characters, enough to tell nodes apart in logs.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Suspect,
    Dead,
}

/// A peer as seen through gossip.
///
/// `incarnation` only ever grows; a peer bumps it to refute a suspicion about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: PeerState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// UDP gossip datagrams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Join { peer: Peer },
    Ping { from: NodeId, incarnation: u64 },
    Ack { from: NodeId, incarnation: u64, peers: Vec<Peer> },
    Suspect { id: NodeId, incarnation: u64 },
    Alive { id: NodeId, incarnation: u64 },
}
