//! Name Directory
//!
//! A small key/value directory used only for master discovery: a master
//! publishes its identity under a per-group key and slaves look it up.
//! Entries are never deleted; a departing master overwrites its entry with
//! [`DirectoryEntry::Invalid`] so late joiners get an explicit "no master".

use async_trait::async_trait;
use axum::{Extension, Json, extract::Path, http::StatusCode};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::types::NodeId;
use crate::compute::types::ComputeGroup;
use crate::error::DirectoryError;

pub const ENDPOINT_DIRECTORY: &str = "/internal/directory";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DirectoryEntry {
    Node(NodeId),
    Invalid,
}

/// Directory key under which the master of `group` is published.
pub fn master_key(group: ComputeGroup) -> String {
    format!("compute/master/{}", group)
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn register(&self, key: &str, entry: DirectoryEntry) -> Result<(), DirectoryError>;

    /// `Ok(None)` when nothing was ever registered under `key`.
    async fn lookup(&self, key: &str) -> Result<Option<DirectoryEntry>, DirectoryError>;
}

#[derive(Default)]
pub struct LocalDirectory {
    entries: DashMap<String, DirectoryEntry>,
}

impl LocalDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Directory for LocalDirectory {
    async fn register(&self, key: &str, entry: DirectoryEntry) -> Result<(), DirectoryError> {
        tracing::debug!("Directory: {} -> {:?}", key, entry);
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<DirectoryEntry>, DirectoryError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}

/// Client for a directory hosted by another node.
pub struct HttpDirectory {
    base_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpDirectory {
    pub fn new(host: std::net::SocketAddr, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            base_url: format!("http://{}{}", host, ENDPOINT_DIRECTORY),
            http_client: reqwest::Client::new(),
            timeout,
        })
    }

    fn url(&self, key: &str) -> String {
        // keys contain '/', which the path extractor would split on
        format!("{}/{}", self.base_url, key.replace('/', "~"))
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn register(&self, key: &str, entry: DirectoryEntry) -> Result<(), DirectoryError> {
        let response = self
            .http_client
            .put(self.url(key))
            .json(&entry)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DirectoryError::Transport(format!("HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<DirectoryEntry>, DirectoryError> {
        let response = self
            .http_client
            .get(self.url(key))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Transport(format!("HTTP {}", response.status())));
        }

        response
            .json::<DirectoryEntry>()
            .await
            .map(Some)
            .map_err(|e| DirectoryError::Malformed {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }
}

fn decode_key(raw: &str) -> String {
    raw.replace('~', "/")
}

pub async fn handle_get_entry(
    Extension(directory): Extension<Arc<LocalDirectory>>,
    Path(raw_key): Path<String>,
) -> (StatusCode, Json<Option<DirectoryEntry>>) {
    match directory.lookup(&decode_key(&raw_key)).await {
        Ok(Some(entry)) => (StatusCode::OK, Json(Some(entry))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(None)),
        Err(e) => {
            tracing::error!("Directory lookup failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(None))
        }
    }
}

pub async fn handle_put_entry(
    Extension(directory): Extension<Arc<LocalDirectory>>,
    Path(raw_key): Path<String>,
    Json(entry): Json<DirectoryEntry>,
) -> StatusCode {
    match directory.register(&decode_key(&raw_key), entry).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!("Directory register failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
