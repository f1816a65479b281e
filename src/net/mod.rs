//! Message Transport
//!
//! The compute layer only needs three things from the network: register a
//! handler per message kind, send one-way, and send a request and wait for its
//! response. [`Network`] is that seam.
//!
//! ## Implementations
//! - **`local`**: in-process hub. Used by tests and single-process simulations;
//!   nodes can be marked offline to simulate crashes.
//! - **`http`**: JSON envelopes POSTed to the peer's HTTP endpoint, addresses
//!   resolved through cluster gossip.

pub mod http;
pub mod local;
pub mod protocol;
pub mod registry;

use async_trait::async_trait;

use crate::cluster::types::NodeId;
use crate::error::NetworkError;
use protocol::{Message, MessageKind};
use registry::MessageHandlerFn;

#[async_trait]
pub trait Network: Send + Sync {
    /// Identity this endpoint sends as.
    fn local_id(&self) -> &NodeId;

    fn register_handler(&self, kind: MessageKind, handler: MessageHandlerFn);

    /// One-way send. Success means the target accepted the message, not that it was handled.
    async fn send(&self, target: &NodeId, message: Message) -> Result<(), NetworkError>;

    /// Request/response with the transport's configured timeout.
    async fn send_and_wait(&self, target: &NodeId, request: Message)
    -> Result<Message, NetworkError>;
}

#[cfg(test)]
mod tests;
