//! Message Handler Registry
//!
//! Maps each [`MessageKind`] to the async closure that handles it on this node.
//! Transports look up the handler for every inbound envelope; request kinds
//! return their response from the closure, one-way kinds return `None`.

use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::protocol::{Envelope, Message, MessageKind};
use crate::error::NetworkError;

/// Type-erased async handler. Resolves to the response for request kinds.
pub type MessageHandlerFn =
    Arc<dyn Fn(Envelope) -> Pin<Box<dyn Future<Output = Option<Message>> + Send>> + Send + Sync>;

/// Boxes a closure into a [`MessageHandlerFn`].
pub fn message_handler<F, Fut>(handler: F) -> MessageHandlerFn
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Message>> + Send + 'static,
{
    Arc::new(move |envelope: Envelope| {
        Box::pin(handler(envelope)) as Pin<Box<dyn Future<Output = Option<Message>> + Send>>
    })
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<MessageKind, MessageHandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers (or replaces) the handler for `kind`.
    pub fn register(&self, kind: MessageKind, handler: MessageHandlerFn) {
        self.handlers.insert(kind, handler);
        tracing::debug!("Registered message handler: {}", kind);
    }

    /// Runs the handler for the envelope's message kind.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<Option<Message>, NetworkError> {
        let kind = envelope.message.kind();

        // clone out so the map shard is not locked while the handler runs
        let handler = self
            .handlers
            .get(&kind)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NetworkError::NoHandler {
                target: envelope.target.clone(),
                kind: kind.to_string(),
            })?;

        tracing::trace!("Dispatching {} from {}", kind, envelope.source);
        Ok(handler(envelope).await)
    }

    #[cfg(test)]
    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    #[cfg(test)]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
