//! Barrier access over HTTP
//!
//! Barriers live in the [`BarrierTable`] of the node that allocated them.
//! Operations on a locally owned barrier go straight to the table; anything
//! else is POSTed to the owner. Sign-on is a long poll: the HTTP request stays
//! open until the round completes or the timeout passes.

use async_trait::async_trait;
use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;
use std::time::Duration;

use super::BarrierService;
use super::table::BarrierTable;
use super::types::{BarrierId, BarrierStatus, ResizeRequest, SignOnRequest};
use crate::cluster::PeerResolver;
use crate::cluster::types::NodeId;
use crate::error::BarrierError;

pub const ENDPOINT_BARRIER_SIGN_ON: &str = "/internal/barrier/sign_on";
pub const ENDPOINT_BARRIER_RESIZE: &str = "/internal/barrier/resize";

pub struct HttpBarrierService {
    node: NodeId,
    local: Arc<BarrierTable>,
    peers: Arc<dyn PeerResolver>,
    http_client: reqwest::Client,
}

impl HttpBarrierService {
    pub fn new(node: NodeId, local: Arc<BarrierTable>, peers: Arc<dyn PeerResolver>) -> Arc<Self> {
        Arc::new(Self {
            node,
            local,
            peers,
            http_client: reqwest::Client::new(),
        })
    }

    fn owner_url(&self, barrier: &BarrierId, endpoint: &str) -> Result<String, BarrierError> {
        let addr = self
            .peers
            .http_addr(&barrier.owner)
            .ok_or_else(|| BarrierError::OwnerUnreachable(barrier.owner.clone()))?;
        Ok(format!("http://{}{}", addr, endpoint))
    }
}

#[async_trait]
impl BarrierService for HttpBarrierService {
    async fn allocate(&self, size: usize) -> Result<BarrierId, BarrierError> {
        Ok(self.local.allocate(size))
    }

    async fn resize(&self, barrier: &BarrierId, size: usize) -> Result<(), BarrierError> {
        if barrier.owner == self.node {
            return self.local.resize(barrier, size);
        }

        let url = self.owner_url(barrier, ENDPOINT_BARRIER_RESIZE)?;
        let response = self
            .http_client
            .post(url)
            .json(&ResizeRequest {
                barrier: barrier.clone(),
                size,
            })
            .send()
            .await
            .map_err(|e| BarrierError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BarrierError::Transport(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn sign_on(
        &self,
        barrier: &BarrierId,
        data: i64,
        timeout: Option<Duration>,
    ) -> Result<Option<BarrierStatus>, BarrierError> {
        if barrier.owner == self.node {
            return self
                .local
                .sign_on(barrier, self.node.clone(), data, timeout)
                .await;
        }

        let url = self.owner_url(barrier, ENDPOINT_BARRIER_SIGN_ON)?;
        let request = SignOnRequest {
            barrier: barrier.clone(),
            signer: self.node.clone(),
            data,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };

        let response = self
            .http_client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BarrierError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BarrierError::UnknownBarrier(barrier.to_string()));
        }
        if !response.status().is_success() {
            return Err(BarrierError::Transport(format!("HTTP {}", response.status())));
        }

        response
            .json::<Option<BarrierStatus>>()
            .await
            .map_err(|e| BarrierError::Transport(e.to_string()))
    }
}

pub async fn handle_sign_on(
    Extension(table): Extension<Arc<BarrierTable>>,
    Json(req): Json<SignOnRequest>,
) -> (StatusCode, Json<Option<BarrierStatus>>) {
    tracing::debug!("Remote sign-on of {} to barrier {}", req.signer, req.barrier);

    let timeout = req.timeout_ms.map(Duration::from_millis);
    match table.sign_on(&req.barrier, req.signer, req.data, timeout).await {
        Ok(status) => (StatusCode::OK, Json(status)),
        Err(BarrierError::UnknownBarrier(id)) => {
            tracing::warn!("Sign-on to unknown barrier {}", id);
            (StatusCode::NOT_FOUND, Json(None))
        }
        Err(e) => {
            tracing::error!("Remote sign-on failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}

pub async fn handle_resize(
    Extension(table): Extension<Arc<BarrierTable>>,
    Json(req): Json<ResizeRequest>,
) -> StatusCode {
    match table.resize(&req.barrier, req.size) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("Remote resize failed: {}", e);
            StatusCode::NOT_FOUND
        }
    }
}
