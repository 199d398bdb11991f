//! Engine configuration
//!
//! Supplied once at construction time; loading from files and the
//! environment is the caller's concern.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::QueueError;
use crate::retry::BackoffPolicy;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 1.0;

/// Options that shape job execution and retry behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retries granted to submissions that don't specify `max_retries`
    pub max_retries: u32,
    /// Retry delay is `backoff_base ^ attempts` seconds
    pub backoff_base: f64,
    /// Timeout in seconds for submissions that don't specify one
    pub default_timeout: u64,
    /// Idle sleep between polls, in seconds
    pub worker_poll_interval: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            default_timeout: DEFAULT_TIMEOUT_SECS,
            worker_poll_interval: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl QueueConfig {
    /// Reject options that would make the engine misbehave
    pub fn validate(&self) -> Result<(), QueueError> {
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(QueueError::Configuration(format!(
                "backoff_base must be a finite number >= 1, got {}",
                self.backoff_base
            )));
        }
        if self.default_timeout == 0 {
            return Err(QueueError::Configuration(
                "default_timeout must be at least 1 second".into(),
            ));
        }
        if !self.worker_poll_interval.is_finite() || self.worker_poll_interval <= 0.0 {
            return Err(QueueError::Configuration(format!(
                "worker_poll_interval must be a positive number of seconds, got {}",
                self.worker_poll_interval
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.worker_poll_interval)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base)
    }
}
