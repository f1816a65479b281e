use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::types::NodeId;

/// Compute group id. Scopes membership, barriers and directory keys.
pub type ComputeGroup = u16;

/// Reserved result code: rendezvous failed, no slave result is known.
pub const RESULT_SYNC_FAILED: i32 = -1;

/// Reserved result code: the slave did not take part in this execution
/// or never reported back.
pub const RESULT_INCONCLUSIVE: i32 = -2;

/// Immediate status codes of an execute request.
pub const STATUS_OK: i32 = 0;
pub const STATUS_BUSY: i32 = 1;
pub const STATUS_UNKNOWN_PAYLOAD: i32 = 2;
/// The request did not come from the master this slave joined.
pub const STATUS_NOT_JOINED: i32 = 3;

/// Status codes of a join response.
pub const JOIN_ACCEPTED: u8 = 0;
pub const JOIN_TRY_LATER: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ComputeRole {
    Master,
    Slave,
}

impl fmt::Display for ComputeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeRole::Master => f.write_str("master"),
            ComputeRole::Slave => f.write_str("slave"),
        }
    }
}

/// States of the compute node control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeState {
    Setup,
    Idle,
    Execute,
    ErrorDie,
    Terminate,
}

impl ComputeState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ComputeState::Setup => 0,
            ComputeState::Idle => 1,
            ComputeState::Execute => 2,
            ComputeState::ErrorDie => 3,
            ComputeState::Terminate => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ComputeState::Setup,
            1 => ComputeState::Idle,
            2 => ComputeState::Execute,
            3 => ComputeState::ErrorDie,
            _ => ComputeState::Terminate,
        }
    }
}

/// How many slaves a payload needs before it may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequiredSlaves {
    /// Run on whatever slaves are joined, at least one.
    #[default]
    Any,
    Exact(usize),
}

/// Work description shipped to slaves. `kind` selects the handler on the
/// slave, `params` is handed to it untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    pub kind: String,
    #[serde(default)]
    pub required_slaves: RequiredSlaves,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskPayload {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            required_slaves: RequiredSlaves::Any,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_required_slaves(mut self, required: RequiredSlaves) -> Self {
        self.required_slaves = required;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Per-slave execution context, built fresh for every dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskContextData {
    pub group: ComputeGroup,
    /// Position of the receiving slave in `slaves`.
    pub rank: usize,
    /// Every slave the task was dispatched to, in dispatch order.
    pub slaves: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
