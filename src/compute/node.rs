//! Compute node control loop
//!
//! One loop per node, parameterized by a [`RoleBehavior`]. The transition
//! table is the same for both roles:
//!
//! ```text
//! SETUP -> IDLE -> EXECUTE -> IDLE -> ...
//!   any state -> ERROR_DIE (stays until shutdown)
//!   any state -> TERMINATE (on shutdown, at the next state boundary)
//! ```
//!
//! The role only decides what each state does and which state comes next.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::types::{ComputeRole, ComputeState};

/// Level-triggered shutdown flag. Unlike a broadcast, late subscribers still
/// see a shutdown that already happened.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn triggered(&self) {
        let mut rx = self.sender.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Sleeps for `duration` unless shutdown comes first. True if the full
    /// duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.triggered() => false,
        }
    }
}

/// Current state of a node, readable from any thread.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(ComputeState::Setup.as_u8()))
    }
}

impl StateCell {
    pub fn get(&self) -> ComputeState {
        ComputeState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: ComputeState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// What a role does in each state of the loop.
#[async_trait]
pub trait RoleBehavior: Send + Sync + 'static {
    fn role(&self) -> ComputeRole;

    fn state_cell(&self) -> &StateCell;

    /// Interval of diagnostics while in `ErrorDie`.
    fn error_die_interval(&self) -> Duration;

    async fn setup(&self, shutdown: &ShutdownSignal) -> ComputeState;

    async fn idle(&self, shutdown: &ShutdownSignal) -> ComputeState;

    async fn execute(&self, shutdown: &ShutdownSignal) -> ComputeState;

    /// Runs once after the loop stopped.
    async fn on_terminate(&self);
}

pub struct ComputeNode<R: RoleBehavior> {
    role: Arc<R>,
    shutdown: ShutdownSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RoleBehavior> ComputeNode<R> {
    /// Spawns the control loop for `role`.
    pub fn start(role: Arc<R>) -> Self {
        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(run_loop(role.clone(), shutdown.clone()));

        Self {
            role,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn role(&self) -> &Arc<R> {
        &self.role
    }

    pub fn state(&self) -> ComputeState {
        self.role.state_cell().get()
    }

    /// Stops the loop and waits until it has fully exited. An execution in
    /// progress completes first. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!("Compute {} loop ended abnormally: {}", self.role.role(), e);
        }
    }
}

async fn run_loop<R: RoleBehavior>(role: Arc<R>, shutdown: ShutdownSignal) {
    let cell = role.state_cell();
    tracing::info!("Compute {} loop started", role.role());

    while !shutdown.is_triggered() {
        let state = cell.get();
        let next = match state {
            ComputeState::Setup => role.setup(&shutdown).await,
            ComputeState::Idle => role.idle(&shutdown).await,
            ComputeState::Execute => role.execute(&shutdown).await,
            ComputeState::ErrorDie => {
                tracing::error!(
                    "Compute {} is in error state, waiting for shutdown",
                    role.role()
                );
                shutdown.sleep(role.error_die_interval()).await;
                ComputeState::ErrorDie
            }
            ComputeState::Terminate => break,
        };

        if next != state {
            tracing::debug!("Compute {}: {:?} -> {:?}", role.role(), state, next);
            cell.set(next);
        }
    }

    role.on_terminate().await;
    cell.set(ComputeState::Terminate);
    tracing::info!("Compute {} loop stopped", role.role());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Walks Setup -> Idle -> Execute -> Idle ... counting executions.
    #[derive(Default)]
    struct CountingRole {
        state: StateCell,
        executions: AtomicUsize,
        terminated: AtomicUsize,
        fail_setup: bool,
    }

    #[async_trait]
    impl RoleBehavior for CountingRole {
        fn role(&self) -> ComputeRole {
            ComputeRole::Master
        }

        fn state_cell(&self) -> &StateCell {
            &self.state
        }

        fn error_die_interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn setup(&self, _shutdown: &ShutdownSignal) -> ComputeState {
            if self.fail_setup {
                ComputeState::ErrorDie
            } else {
                ComputeState::Idle
            }
        }

        async fn idle(&self, shutdown: &ShutdownSignal) -> ComputeState {
            shutdown.sleep(Duration::from_millis(1)).await;
            ComputeState::Execute
        }

        async fn execute(&self, _shutdown: &ShutdownSignal) -> ComputeState {
            self.executions.fetch_add(1, Ordering::SeqCst);
            ComputeState::Idle
        }

        async fn on_terminate(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_loop_cycles_and_shuts_down_cleanly() {
        let role = Arc::new(CountingRole::default());
        let node = ComputeNode::start(role.clone());

        while role.executions.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        node.shutdown().await;
        node.shutdown().await;

        assert_eq!(node.state(), ComputeState::Terminate);
        assert_eq!(role.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_setup_stays_in_error_die_until_shutdown() {
        let role = Arc::new(CountingRole {
            fail_setup: true,
            ..CountingRole::default()
        });
        let node = ComputeNode::start(role.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(node.state(), ComputeState::ErrorDie);
        assert_eq!(role.executions.load(Ordering::SeqCst), 0);

        node.shutdown().await;
        assert_eq!(node.state(), ComputeState::Terminate);
    }

    #[tokio::test]
    async fn test_shutdown_signal_seen_by_late_waiters() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        // already triggered: returns at once
        signal.triggered().await;
        assert!(!signal.sleep(Duration::from_secs(60)).await);
    }
}
