//! Lifecycle event feed
//!
//! Events are mirrored to `tracing` and broadcast to any subscribers. The
//! engine never waits on a subscriber; slow ones miss events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const FEED_CAPACITY: usize = 1024;

/// Something that happened to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Claimed { job_id: String, at: DateTime<Utc> },
    Completed {
        job_id: String,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    Failed {
        job_id: String,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },
    DeadLettered {
        job_id: String,
        attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },
    /// Failed -> Pending once the backoff elapsed
    Requeued { job_id: String, at: DateTime<Utc> },
    /// Operator moved a job out of the DLQ
    DlqRetried { job_id: String, at: DateTime<Utc> },
    /// An abandoned Processing job was failed by crash recovery
    Recovered { job_id: String, at: DateTime<Utc> },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Claimed { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::DeadLettered { job_id, .. }
            | Self::Requeued { job_id, .. }
            | Self::DlqRetried { job_id, .. }
            | Self::Recovered { job_id, .. } => job_id,
        }
    }

    fn log(&self) {
        match self {
            Self::Claimed { job_id, .. } => info!(job_id = %job_id, "Job claimed"),
            Self::Completed {
                job_id,
                duration_ms,
                ..
            } => info!(job_id = %job_id, duration_ms, "Job completed"),
            Self::Failed {
                job_id,
                attempts,
                next_retry_at,
                error,
                ..
            } => warn!(
                job_id = %job_id,
                attempts,
                next_retry_at = %next_retry_at,
                error = %error,
                "Job failed, retry scheduled"
            ),
            Self::DeadLettered {
                job_id,
                attempts,
                error,
                ..
            } => error!(job_id = %job_id, attempts, error = %error, "Job moved to DLQ"),
            Self::Requeued { job_id, .. } => info!(job_id = %job_id, "Job requeued for retry"),
            Self::DlqRetried { job_id, .. } => info!(job_id = %job_id, "Job reset from DLQ"),
            Self::Recovered { job_id, .. } => {
                warn!(job_id = %job_id, "Recovered job abandoned in processing")
            }
        }
    }
}

/// Append-only broadcast of [`JobEvent`]s
#[derive(Debug, Clone)]
pub struct EventFeed {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }
}

impl EventFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: JobEvent) {
        event.log();
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}
