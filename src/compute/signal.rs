//! Out-of-band signals between members of a compute group.

use std::fmt;
use std::sync::Arc;

use crate::cluster::types::NodeId;
use crate::error::NetworkError;
use crate::net::Network;
use crate::net::protocol::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Abort,
}

impl SignalKind {
    pub fn code(self) -> u8 {
        match self {
            SignalKind::Abort => 1,
        }
    }

    /// `None` for codes this node does not understand.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SignalKind::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Abort => f.write_str("ABORT"),
        }
    }
}

/// Fire-and-forget signal sender.
#[derive(Clone)]
pub struct SignalChannel {
    network: Arc<dyn Network>,
}

impl SignalChannel {
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self { network }
    }

    /// Sends one signal without waiting for it to be handled.
    ///
    /// # Returns
    /// * `Ok(())` - Delivered to the target's transport
    /// * `Err(NetworkError)` - Target unknown or unreachable
    pub async fn signal(&self, kind: SignalKind, target: &NodeId) -> Result<(), NetworkError> {
        tracing::debug!("Sending signal {} to {}", kind, target);
        self.network
            .send(target, Message::Signal { code: kind.code() })
            .await
    }

    /// Sends `kind` to every target except `skip`; returns how many sends succeeded.
    pub async fn broadcast(&self, kind: SignalKind, targets: &[NodeId], skip: &NodeId) -> usize {
        let mut delivered = 0;

        for target in targets.iter().filter(|target| *target != skip) {
            match self.signal(kind, target).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Signal {} to {} failed: {}", kind, target, e),
            }
        }
        delivered
    }
}
