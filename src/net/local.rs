//! In-process transport
//!
//! Every node attached to a [`LocalHub`] gets a [`LocalNetwork`] endpoint.
//! Delivery is a direct call into the target's handler registry. Marking a
//! node offline makes sends to and from it fail and drops it from liveness,
//! which is how tests simulate crashed slaves.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::Network;
use super::protocol::{Envelope, Message, MessageKind};
use super::registry::{HandlerRegistry, MessageHandlerFn};
use crate::cluster::Liveness;
use crate::cluster::types::NodeId;
use crate::error::NetworkError;

/// One delivered message, as recorded by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: MessageKind,
}

pub struct LocalHub {
    nodes: DashMap<NodeId, Arc<HandlerRegistry>>,
    offline: DashSet<NodeId>,
    deliveries: Mutex<Vec<Delivery>>,
    request_timeout: Duration,
}

impl LocalHub {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            offline: DashSet::new(),
            deliveries: Mutex::new(Vec::new()),
            request_timeout,
        })
    }

    /// Creates the endpoint for `id`. Attaching the same id twice replaces its handlers.
    pub fn attach(self: &Arc<Self>, id: NodeId) -> Arc<LocalNetwork> {
        let handlers = HandlerRegistry::new();
        self.nodes.insert(id.clone(), handlers.clone());
        self.offline.remove(&id);

        Arc::new(LocalNetwork {
            id,
            hub: self.clone(),
            handlers,
        })
    }

    pub fn set_offline(&self, id: &NodeId, offline: bool) {
        if offline {
            tracing::debug!("Hub: {} goes offline", id);
            self.offline.insert(id.clone());
        } else {
            self.offline.remove(id);
        }
    }

    /// Everything delivered so far, in send order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    /// Delivered messages of one kind.
    pub async fn deliveries_of(&self, kind: MessageKind) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .await
            .iter()
            .filter(|delivery| delivery.kind == kind)
            .cloned()
            .collect()
    }

    fn route(&self, source: &NodeId, target: &NodeId) -> Result<Arc<HandlerRegistry>, NetworkError> {
        if self.offline.contains(source) || self.offline.contains(target) {
            return Err(NetworkError::SendFailed {
                target: target.clone(),
                reason: "node offline".to_string(),
            });
        }

        self.nodes
            .get(target)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NetworkError::UnknownPeer(target.clone()))
    }

    async fn record(&self, envelope: &Envelope) {
        self.deliveries.lock().await.push(Delivery {
            source: envelope.source.clone(),
            target: envelope.target.clone(),
            kind: envelope.message.kind(),
        });
    }
}

impl Liveness for LocalHub {
    fn online_node_ids(&self) -> HashSet<NodeId> {
        self.nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !self.offline.contains(id))
            .collect()
    }
}

pub struct LocalNetwork {
    id: NodeId,
    hub: Arc<LocalHub>,
    handlers: Arc<HandlerRegistry>,
}

#[async_trait]
impl Network for LocalNetwork {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    fn register_handler(&self, kind: MessageKind, handler: MessageHandlerFn) {
        self.handlers.register(kind, handler);
    }

    async fn send(&self, target: &NodeId, message: Message) -> Result<(), NetworkError> {
        let registry = self.hub.route(&self.id, target)?;
        let envelope = Envelope {
            source: self.id.clone(),
            target: target.clone(),
            message,
        };
        self.hub.record(&envelope).await;

        tokio::spawn(async move {
            if let Err(e) = registry.dispatch(envelope).await {
                tracing::warn!("Local delivery failed: {}", e);
            }
        });

        Ok(())
    }

    async fn send_and_wait(
        &self,
        target: &NodeId,
        request: Message,
    ) -> Result<Message, NetworkError> {
        let registry = self.hub.route(&self.id, target)?;
        let expected = request.kind();
        let envelope = Envelope {
            source: self.id.clone(),
            target: target.clone(),
            message: request,
        };
        self.hub.record(&envelope).await;

        match tokio::time::timeout(self.hub.request_timeout, registry.dispatch(envelope)).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(NetworkError::UnexpectedResponse {
                target: target.clone(),
                expected: format!("response to {}", expected),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NetworkError::Timeout(target.clone())),
        }
    }
}
