//! Job store trait
//!
//! The store is the only synchronization point between workers: claims and
//! resets are conditional writes that take effect only if the row is still
//! in the expected state at write time.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::QueueError;
use crate::job::{Job, JobFilter, JobState, JobStats, JobUpdate};

/// Extra time a Processing job gets past its timeout before it is
/// considered abandoned.
pub const STALE_GRACE_SECS: i64 = 30;

/// Timeouts beyond this are treated as this for staleness checks
const MAX_TIMEOUT_SECS: u64 = 10 * 365 * 24 * 3600;

/// Whether a Processing job has outlived its timeout plus grace.
pub fn is_stale(job: &Job, now: DateTime<Utc>) -> bool {
    let timeout = job.timeout_secs.min(MAX_TIMEOUT_SECS) as i64;
    job.state == JobState::Processing
        && job.updated_at + Duration::seconds(timeout + STALE_GRACE_SECS) <= now
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Persist a new job as Pending with zero attempts
    async fn add_job(&self, job: &Job) -> Result<(), QueueError>;

    async fn get_job(&self, id: &str) -> Result<Job, QueueError>;

    /// Atomically move the best eligible Pending job to Processing.
    ///
    /// Best means highest priority, then earliest `created_at`. Returns
    /// `None` when nothing is eligible at `now`.
    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError>;

    /// Apply a partial update to one job
    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job, QueueError>;

    /// Apply a partial update only if the job is still in `expected`
    async fn update_job_if(
        &self,
        id: &str,
        expected: JobState,
        update: JobUpdate,
    ) -> Result<Job, QueueError>;

    /// Failed jobs whose `next_retry_at` has passed, earliest first
    async fn get_retryable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;

    /// Failed -> Pending, only if still Failed and due at write time.
    /// Losing the race yields `ClaimConflict`.
    async fn reset_retryable_to_pending(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError>;

    /// Newest first
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError>;

    async fn get_dlq_jobs(&self) -> Result<Vec<Job>, QueueError> {
        self.list_jobs(&JobFilter::state(JobState::Dead)).await
    }

    async fn get_stats(&self) -> Result<JobStats, QueueError>;

    /// Operator DLQ retry: Dead -> Pending with attempts reset to 0
    async fn reset_dead_to_pending(&self, id: &str, now: DateTime<Utc>)
        -> Result<Job, QueueError>;

    /// Processing jobs abandoned past their timeout (see [`is_stale`])
    async fn get_stale_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;
}
