//! Compute Wire Protocol
//!
//! Message kinds exchanged between members of a compute group. Framing and
//! correlation belong to the transport; these are payload fields only.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::types::NodeId;
use crate::compute::types::{TaskContextData, TaskId, TaskPayload};
use crate::sync::types::BarrierId;

pub const ENDPOINT_MESSAGE: &str = "/internal/message";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// slave -> master; the sender identity travels in the envelope.
    JoinRequest,

    /// master -> slave. `barrier` is only set when `status` is accepted.
    JoinResponse {
        status: u8,
        barrier: Option<BarrierId>,
    },

    /// master -> slave
    ExecuteRequest {
        barrier_tag: u32,
        context: TaskContextData,
        payload: TaskPayload,
    },

    /// slave -> master, immediate accept (0) or reject (anything else).
    ExecuteResponse { status: i32 },

    /// any <-> any. Codes outside [`crate::compute::signal::SignalKind`] are ignored on receipt.
    Signal { code: u8 },

    /// any node -> master, for tasks submitted away from the master.
    SubmitTask { payload: TaskPayload },

    SubmitResponse {
        accepted: bool,
        task_id: Option<TaskId>,
    },

    /// master -> submitting node once a forwarded task completed.
    TaskFinished { task_id: TaskId, codes: Vec<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    JoinRequest,
    JoinResponse,
    ExecuteRequest,
    ExecuteResponse,
    Signal,
    SubmitTask,
    SubmitResponse,
    TaskFinished,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::JoinRequest => MessageKind::JoinRequest,
            Message::JoinResponse { .. } => MessageKind::JoinResponse,
            Message::ExecuteRequest { .. } => MessageKind::ExecuteRequest,
            Message::ExecuteResponse { .. } => MessageKind::ExecuteResponse,
            Message::Signal { .. } => MessageKind::Signal,
            Message::SubmitTask { .. } => MessageKind::SubmitTask,
            Message::SubmitResponse { .. } => MessageKind::SubmitResponse,
            Message::TaskFinished { .. } => MessageKind::TaskFinished,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A message plus its routing header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub source: NodeId,
    pub target: NodeId,
    pub message: Message,
}
