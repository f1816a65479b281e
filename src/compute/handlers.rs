use async_trait::async_trait;
use axum::{Extension, Json, extract::Path, http::StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::master::ComputeMaster;
use super::slave::ComputeSlave;
use super::task::{ResultStore, TaskRecord};
use super::types::{ComputeGroup, ComputeRole, ComputeState, TaskId, TaskPayload};
use crate::cluster::types::NodeId;
use crate::error::{ComputeError, Result};

pub const ENDPOINT_SUBMIT: &str = "/compute/submit";
pub const ENDPOINT_STATUS: &str = "/compute/status";
pub const ENDPOINT_TASK: &str = "/compute/task";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub accepted: bool,
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: ComputeRole,
    pub group: ComputeGroup,
    pub state: ComputeState,
    /// Master's own id on a master, the joined master on a slave.
    pub master: Option<NodeId>,
    pub queue_depth: Option<usize>,
    pub tasks_processed: Option<u64>,
    pub slaves: Vec<NodeId>,
    pub executing: bool,
}

/// What the HTTP API needs from a compute node, whatever its role.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn submit_payload(&self, payload: TaskPayload) -> Result<TaskId>;

    async fn status(&self) -> NodeStatus;

    fn results(&self) -> &ResultStore;
}

#[async_trait]
impl ComputeApi for ComputeMaster {
    async fn submit_payload(&self, payload: TaskPayload) -> Result<TaskId> {
        ComputeMaster::submit_payload(self, payload)
    }

    async fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id().clone(),
            role: ComputeRole::Master,
            group: self.group(),
            state: self.state(),
            master: Some(self.id().clone()),
            queue_depth: Some(self.depth()),
            tasks_processed: Some(self.tasks_processed()),
            slaves: self.connected_slaves(),
            executing: self.state() == ComputeState::Execute,
        }
    }

    fn results(&self) -> &ResultStore {
        ComputeMaster::results(self)
    }
}

#[async_trait]
impl ComputeApi for ComputeSlave {
    async fn submit_payload(&self, payload: TaskPayload) -> Result<TaskId> {
        self.submit(payload).await
    }

    async fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id().clone(),
            role: ComputeRole::Slave,
            group: self.group(),
            state: self.state(),
            master: self.master().await.map(|master| master.id),
            queue_depth: None,
            tasks_processed: None,
            slaves: Vec::new(),
            executing: self.is_executing().await,
        }
    }

    fn results(&self) -> &ResultStore {
        ComputeSlave::results(self)
    }
}

pub async fn handle_submit(
    Extension(node): Extension<Arc<dyn ComputeApi>>,
    Json(payload): Json<TaskPayload>,
) -> (StatusCode, Json<SubmitTaskResponse>) {
    match node.submit_payload(payload).await {
        Ok(task_id) => {
            tracing::info!("Task submitted: {}", task_id);
            (
                StatusCode::OK,
                Json(SubmitTaskResponse {
                    accepted: true,
                    task_id: Some(task_id),
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::warn!("Task submission failed: {}", e);
            let status = match e {
                ComputeError::QueueFull { .. }
                | ComputeError::Rejected(_)
                | ComputeError::NotJoined => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(SubmitTaskResponse {
                    accepted: false,
                    task_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_status(Extension(node): Extension<Arc<dyn ComputeApi>>) -> Json<NodeStatus> {
    Json(node.status().await)
}

pub async fn handle_get_task(
    Extension(node): Extension<Arc<dyn ComputeApi>>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Option<TaskRecord>>) {
    match node.results().get(&TaskId(task_id)) {
        Some(record) => (StatusCode::OK, Json(Some(record))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}
