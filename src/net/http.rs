//! HTTP transport
//!
//! Envelopes are POSTed as JSON to [`ENDPOINT_MESSAGE`] on the target's HTTP
//! address. The response body is `Option<Message>`: the reply for request
//! kinds, `null` for one-way kinds.

use async_trait::async_trait;
use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;
use std::time::Duration;

use super::Network;
use super::protocol::{ENDPOINT_MESSAGE, Envelope, Message, MessageKind};
use super::registry::{HandlerRegistry, MessageHandlerFn};
use crate::cluster::PeerResolver;
use crate::cluster::types::NodeId;
use crate::error::NetworkError;

pub struct HttpNetwork {
    id: NodeId,
    peers: Arc<dyn PeerResolver>,
    handlers: Arc<HandlerRegistry>,
    http_client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpNetwork {
    pub fn new(id: NodeId, peers: Arc<dyn PeerResolver>, request_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            peers,
            handlers: HandlerRegistry::new(),
            http_client: reqwest::Client::new(),
            request_timeout,
        })
    }

    /// Entry point for inbound envelopes (called by the axum route).
    pub async fn deliver(&self, envelope: Envelope) -> Result<Option<Message>, NetworkError> {
        if envelope.target != self.id {
            tracing::warn!(
                "Envelope for {} arrived at {}, handling anyway",
                envelope.target,
                self.id
            );
        }
        self.handlers.dispatch(envelope).await
    }

    async fn post(&self, target: &NodeId, message: Message) -> Result<Option<Message>, NetworkError> {
        let addr = self
            .peers
            .http_addr(target)
            .ok_or_else(|| NetworkError::UnknownPeer(target.clone()))?;

        let envelope = Envelope {
            source: self.id.clone(),
            target: target.clone(),
            message,
        };

        let response = self
            .http_client
            .post(format!("http://{}{}", addr, ENDPOINT_MESSAGE))
            .json(&envelope)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NetworkError::Timeout(target.clone())
                } else {
                    NetworkError::SendFailed {
                        target: target.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(NetworkError::NoHandler {
                target: target.clone(),
                kind: envelope.message.kind().to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(NetworkError::SendFailed {
                target: target.clone(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        response
            .json::<Option<Message>>()
            .await
            .map_err(|e| NetworkError::SendFailed {
                target: target.clone(),
                reason: format!("bad response body: {}", e),
            })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    fn register_handler(&self, kind: MessageKind, handler: MessageHandlerFn) {
        self.handlers.register(kind, handler);
    }

    async fn send(&self, target: &NodeId, message: Message) -> Result<(), NetworkError> {
        self.post(target, message).await.map(|_| ())
    }

    async fn send_and_wait(
        &self,
        target: &NodeId,
        request: Message,
    ) -> Result<Message, NetworkError> {
        let expected = request.kind();
        self.post(target, request)
            .await?
            .ok_or_else(|| NetworkError::UnexpectedResponse {
                target: target.clone(),
                expected: format!("response to {}", expected),
            })
    }
}

pub async fn handle_message(
    Extension(network): Extension<Arc<HttpNetwork>>,
    Json(envelope): Json<Envelope>,
) -> (StatusCode, Json<Option<Message>>) {
    let source = envelope.source.clone();

    match network.deliver(envelope).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(NetworkError::NoHandler { kind, .. }) => {
            tracing::debug!("No handler for {} from {}", kind, source);
            (StatusCode::NOT_FOUND, Json(None))
        }
        Err(e) => {
            tracing::error!("Failed to handle message from {}: {}", source, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}
