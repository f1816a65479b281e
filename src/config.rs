//! Compute node configuration
//!
//! All timing knobs of the control loop live here. Durations are stored in
//! milliseconds so the struct reads naturally from JSON or environment
//! variables; use the accessor methods to get `Duration`s.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::compute::types::{ComputeGroup, ComputeRole};
use crate::error::ComputeError;

/// Maximum number of queued tasks a master accepts.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub group: ComputeGroup,
    pub role: ComputeRole,
    pub max_queue_depth: usize,
    /// Liveness sweep cadence on an idle master; master check cadence on a slave.
    pub ping_interval_ms: u64,
    /// Sleep while tasks are queued but no slave has joined.
    pub no_slave_backoff_ms: u64,
    /// Sleep between membership checks while waiting for a task's quorum.
    pub quorum_poll_ms: u64,
    /// Sleep of an idle master with nothing to do.
    pub idle_poll_ms: u64,
    /// Slave retry interval for master lookup and join.
    pub join_retry_ms: u64,
    /// Diagnostic interval in the error state.
    pub error_die_interval_ms: u64,
    /// Timeout for synchronous requests.
    pub request_timeout_ms: u64,
    /// Upper bound the local barrier engine puts on sign-ons without their own timeout.
    pub barrier_timeout_ms: Option<u64>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            group: 0,
            role: ComputeRole::Slave,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            ping_interval_ms: 1_000,
            no_slave_backoff_ms: 2_000,
            quorum_poll_ms: 2_000,
            idle_poll_ms: 10,
            join_retry_ms: 1_000,
            error_die_interval_ms: 1_000,
            request_timeout_ms: 5_000,
            barrier_timeout_ms: None,
        }
    }
}

impl ComputeConfig {
    pub fn new(role: ComputeRole, group: ComputeGroup) -> Self {
        Self {
            role,
            group,
            ..Self::default()
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn no_slave_backoff(&self) -> Duration {
        Duration::from_millis(self.no_slave_backoff_ms)
    }

    pub fn quorum_poll(&self) -> Duration {
        Duration::from_millis(self.quorum_poll_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }

    pub fn error_die_interval(&self) -> Duration {
        Duration::from_millis(self.error_die_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.max_queue_depth == 0 {
            return Err(ComputeError::InvalidConfig(
                "max_queue_depth must be at least 1".to_string(),
            ));
        }

        let intervals = [
            ("ping_interval_ms", self.ping_interval_ms),
            ("no_slave_backoff_ms", self.no_slave_backoff_ms),
            ("quorum_poll_ms", self.quorum_poll_ms),
            ("idle_poll_ms", self.idle_poll_ms),
            ("join_retry_ms", self.join_retry_ms),
            ("error_die_interval_ms", self.error_die_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ComputeError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if self.barrier_timeout_ms == Some(0) {
            return Err(ComputeError::InvalidConfig(
                "barrier_timeout_ms must be non-zero when set".to_string(),
            ));
        }

        Ok(())
    }
}
