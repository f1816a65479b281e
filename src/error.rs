//! Error types for the compute layer
//!
//! Each consumed collaborator (transport, barrier service, directory) has its own
//! error enum so callers can tell a dead peer from a protocol violation.
//! `ComputeError` is what the node itself reports.

use thiserror::Error;

use crate::cluster::types::NodeId;

/// Failures of the message transport.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No address or mailbox is known for the target.
    #[error("Unknown peer {0}")]
    UnknownPeer(NodeId),

    /// The peer is known but could not be reached.
    #[error("Sending to {target} failed: {reason}")]
    SendFailed { target: NodeId, reason: String },

    /// No response arrived within the request timeout.
    #[error("Request to {0} timed out")]
    Timeout(NodeId),

    /// The receiving node has no handler registered for this message kind.
    #[error("No handler for {kind} on {target}")]
    NoHandler { target: NodeId, kind: String },

    /// A request was answered with nothing or with the wrong message kind.
    #[error("Unexpected response from {target}: expected {expected}")]
    UnexpectedResponse { target: NodeId, expected: String },
}

/// Failures of the barrier service.
#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("Barrier {0} does not exist")]
    UnknownBarrier(String),

    #[error("Barrier owner {0} is unreachable")]
    OwnerUnreachable(NodeId),

    #[error("Barrier request failed: {0}")]
    Transport(String),
}

/// Failures of the name directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Directory request failed: {0}")]
    Transport(String),

    #[error("Malformed directory entry for {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Errors reported by compute nodes.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Another master is already registered for this compute group.
    #[error("Node {owner} is already master of compute group {group}")]
    MasterConflict { group: u16, owner: NodeId },

    /// Operation needs a master this slave has not joined yet.
    #[error("Slave has not joined a master")]
    NotJoined,

    /// Submission refused because the queue is full.
    #[error("Task queue is full ({max} tasks)")]
    QueueFull { max: usize },

    /// The master refused a forwarded submission.
    #[error("Master {0} rejected the task")]
    Rejected(NodeId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Barrier(#[from] BarrierError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl NetworkError {
    /// True if the target should be considered gone rather than merely slow or confused.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            NetworkError::UnknownPeer(_) | NetworkError::SendFailed { .. } | NetworkError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;
