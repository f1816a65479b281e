//! Master/Slave Compute Cluster Library
//!
//! Core of a distributed compute layer: one master per compute group hands
//! out tasks to a changing set of slaves and collects their results through
//! a barrier rendezvous. The binary (`main.rs`) wires it to real networking.
//!
//! ## Architecture Modules
//! - **`compute`**: task queue, membership, dispatcher and the master/slave control loop.
//! - **`cluster`**: node identities plus UDP gossip answering "who is online" and "where do they listen".
//! - **`net`**: message transport seam (`Network`) with in-process and HTTP implementations.
//! - **`sync`**: barrier service: allocate, resize, sign on and collect per-signer data.
//! - **`directory`**: key/value directory used for master discovery.
//! - **`config`**: timing and sizing knobs of a compute node.
//! - **`error`**: typed errors of every layer.

pub mod cluster;
pub mod compute;
pub mod config;
pub mod directory;
pub mod error;
pub mod net;
pub mod sync;
