//! Master/Slave Compute Groups
//!
//! A compute group is one master and a changing set of slaves. The master
//! queues submitted tasks and runs them, one at a time, on every slave it
//! currently knows about; slaves report their result codes through a barrier
//! rendezvous and the master hands the ordered codes to the task's listeners.
//!
//! ## Submodules
//! - **`node`**: the per-node control loop (SETUP, IDLE, EXECUTE, ERROR_DIE, TERMINATE).
//! - **`master`** / **`slave`**: what each role does in those states, plus their message handlers.
//! - **`queue`**: bounded task queue with admission control.
//! - **`membership`**: ordered slave registry guarded by the lock that also freezes dispatch.
//! - **`dispatch`**: one fan-out and rendezvous cycle for a single task.
//! - **`barrier`**: adapter over the barrier service, result alignment and barrier tags.
//! - **`signal`**: out-of-band signals (ABORT).
//! - **`payloads`**: named payload handlers executed by slaves.
//! - **`handlers`**: HTTP API for submitting tasks and reading status.

pub mod barrier;
pub mod dispatch;
pub mod handlers;
pub mod master;
pub mod membership;
pub mod node;
pub mod payloads;
pub mod queue;
pub mod signal;
pub mod slave;
pub mod task;
pub mod types;
