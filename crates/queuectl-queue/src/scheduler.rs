//! Job selection and attempt processing
//!
//! The scheduler is stateless apart from its handles: every decision it
//! makes is re-checked by the store at write time, so any number of
//! schedulers (in one process or many) may share a store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::events::{EventFeed, JobEvent};
use crate::executor::{CommandExecutor, ExecutionOutcome};
use crate::job::{Job, JobState, JobUpdate};
use crate::metrics::Metrics;
use crate::retry::{plan_transition, BackoffPolicy, Transition};
use crate::store::JobStore;

/// Error recorded on jobs failed by crash recovery
pub const INTERRUPTED_ERROR: &str = "worker interrupted before completion";

/// Attempts at persisting a finished attempt while the store is busy
const PERSIST_RETRIES: u32 = 5;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executor: CommandExecutor,
    backoff: BackoffPolicy,
    metrics: Arc<Metrics>,
    events: EventFeed,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, config: &QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            store,
            executor: CommandExecutor::new(),
            backoff: config.backoff(),
            metrics: Arc::new(Metrics::new()),
            events: EventFeed::new(),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_events(mut self, events: EventFeed) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn events(&self) -> &EventFeed {
        &self.events
    }

    /// Claim the next job to run, promoting due retries first if no Pending
    /// job is eligible.
    ///
    /// A retryable job that another worker reset or claimed in the meantime
    /// is skipped silently.
    pub async fn get_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        if let Some(job) = self.claim(now).await? {
            return Ok(Some(job));
        }

        let retryable = self.store.get_retryable_jobs(now).await?;
        if retryable.is_empty() {
            return Ok(None);
        }

        for job in retryable {
            match self.store.reset_retryable_to_pending(&job.id, now).await {
                Ok(job) => self.events.publish(JobEvent::Requeued {
                    job_id: job.id,
                    at: now,
                }),
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %job.id, "Retry already taken by another worker");
                }
                Err(e) => return Err(e),
            }
        }

        self.claim(now).await
    }

    async fn claim(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let job = self.store.claim_next_job(now).await?;
        if let Some(job) = &job {
            self.events.publish(JobEvent::Claimed {
                job_id: job.id.clone(),
                at: now,
            });
        }
        Ok(job)
    }

    /// Run one attempt of a claimed job and record where it lands.
    ///
    /// The job must be Processing; the result is only written if it still is.
    pub async fn process_job(&self, job: Job) -> Result<Job, QueueError> {
        if job.state != JobState::Processing {
            return Err(QueueError::ClaimConflict(job.id));
        }

        let started = Instant::now();
        let outcome = self.executor.run(&job.command, job.timeout()).await;
        let elapsed = started.elapsed();
        self.metrics.record_execution(elapsed, outcome.is_success());

        let now = Utc::now();
        let (transition, update) = plan_transition(&job, &outcome, &self.backoff, now);
        let updated = self.persist(&job.id, update).await?;
        self.publish_transition(&updated, &transition, elapsed, now);

        Ok(updated)
    }

    async fn persist(&self, id: &str, update: JobUpdate) -> Result<Job, QueueError> {
        let mut delay = PERSIST_RETRY_DELAY;
        let mut tries = 0;
        loop {
            match self
                .store
                .update_job_if(id, JobState::Processing, update.clone())
                .await
            {
                Err(e) if e.is_transient() && tries < PERSIST_RETRIES => {
                    warn!(job_id = %id, error = %e, "Store busy, retrying result write");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    tries += 1;
                }
                other => return other,
            }
        }
    }

    fn publish_transition(
        &self,
        job: &Job,
        transition: &Transition,
        elapsed: Duration,
        now: DateTime<Utc>,
    ) {
        let job_id = job.id.clone();
        let error = job.error.clone().unwrap_or_default();
        let event = match *transition {
            Transition::Completed => JobEvent::Completed {
                job_id,
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                at: now,
            },
            Transition::RetryAt { attempts, at } => JobEvent::Failed {
                job_id,
                attempts,
                next_retry_at: at,
                error,
                at: now,
            },
            Transition::DeadLetter { attempts } => JobEvent::DeadLettered {
                job_id,
                attempts,
                error,
                at: now,
            },
        };
        self.events.publish(event);
    }

    /// Fail Processing jobs abandoned by a dead worker through the normal
    /// retry/DLQ path. Returns how many were recovered.
    pub async fn recover_stale_jobs(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let stale = self.store.get_stale_jobs(now).await?;
        let interrupted = ExecutionOutcome::Failed {
            exit_code: None,
            output: String::new(),
            error: INTERRUPTED_ERROR.to_string(),
        };

        let mut recovered = 0;
        for job in stale {
            let (transition, update) = plan_transition(&job, &interrupted, &self.backoff, now);
            match self
                .store
                .update_job_if(&job.id, JobState::Processing, update)
                .await
            {
                Ok(updated) => {
                    self.events.publish(JobEvent::Recovered {
                        job_id: updated.id.clone(),
                        at: now,
                    });
                    self.publish_transition(&updated, &transition, Duration::ZERO, now);
                    recovered += 1;
                }
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %job.id, "Stale job finished before recovery");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }

    /// Operator DLQ retry
    pub async fn retry_dead_job(&self, id: &str) -> Result<Job, QueueError> {
        let now = Utc::now();
        let job = self.store.reset_dead_to_pending(id, now).await?;
        self.events.publish(JobEvent::DlqRetried {
            job_id: job.id.clone(),
            at: now,
        });
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryJobStore;
    use chrono::Duration as ChronoDuration;

    fn scheduler(store: &MemoryJobStore) -> Scheduler {
        Scheduler::new(Arc::new(store.clone()), &QueueConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = QueueConfig {
            backoff_base: 0.5,
            ..QueueConfig::default()
        };
        let result = Scheduler::new(Arc::new(MemoryJobStore::new()), &config);
        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_get_next_job_prefers_pending_over_retry() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.add_job(&Job::new("retry", "true", now)).await.unwrap();
        store.claim_next_job(now).await.unwrap();
        store
            .update_job(
                "retry",
                JobUpdate::at(now)
                    .state(JobState::Failed)
                    .attempts(1)
                    .next_retry_at(Some(now - ChronoDuration::seconds(1))),
            )
            .await
            .unwrap();
        store.add_job(&Job::new("fresh", "true", now)).await.unwrap();

        let sched = scheduler(&store);
        let job = sched.get_next_job(now).await.unwrap().unwrap();
        assert_eq!(job.id, "fresh");
        assert_eq!(store.get_job("retry").await.unwrap().state, JobState::Failed);

        let job = sched.get_next_job(now).await.unwrap().unwrap();
        assert_eq!(job.id, "retry");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state, JobState::Processing);
    }

    #[tokio::test]
    async fn test_retry_not_due_is_not_claimed() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.add_job(&Job::new("a", "true", now)).await.unwrap();
        store.claim_next_job(now).await.unwrap();
        store
            .update_job(
                "a",
                JobUpdate::at(now)
                    .state(JobState::Failed)
                    .attempts(1)
                    .next_retry_at(Some(now + ChronoDuration::seconds(60))),
            )
            .await
            .unwrap();

        assert!(scheduler(&store).get_next_job(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_job_success() {
        let store = MemoryJobStore::new();
        let sched = scheduler(&store);
        let mut events = sched.events().subscribe();
        store
            .add_job(&Job::new("job1", "echo 'Hello World'", Utc::now()))
            .await
            .unwrap();

        let job = sched.get_next_job(Utc::now()).await.unwrap().unwrap();
        let done = sched.process_job(job).await.unwrap();

        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 0);
        assert_eq!(done.output.as_deref(), Some("Hello World\n"));
        assert_eq!(sched.metrics().snapshot().succeeded, 1);

        assert!(matches!(events.recv().await.unwrap(), JobEvent::Claimed { .. }));
        assert!(matches!(events.recv().await.unwrap(), JobEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn test_process_job_failure_schedules_retry() {
        let store = MemoryJobStore::new();
        let sched = scheduler(&store);
        store
            .add_job(&Job::new("bad", "exit 3", Utc::now()).with_max_retries(3))
            .await
            .unwrap();

        let before = Utc::now();
        let job = sched.get_next_job(before).await.unwrap().unwrap();
        let failed = sched.process_job(job).await.unwrap();

        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(
            failed.error.as_deref(),
            Some("Command failed with exit code 3")
        );
        let next = failed.next_retry_at.unwrap();
        assert!(next >= before + ChronoDuration::seconds(2));
        assert_eq!(sched.metrics().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_process_job_requires_processing_state() {
        let store = MemoryJobStore::new();
        let job = Job::new("a", "true", Utc::now());
        store.add_job(&job).await.unwrap();

        let err = scheduler(&store).process_job(job).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get_job("a").await.unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_recover_stale_jobs() {
        let store = MemoryJobStore::new();
        let then = Utc::now() - ChronoDuration::seconds(3600);
        store
            .add_job(&Job::new("stuck", "sleep 100", then).with_timeout_secs(10))
            .await
            .unwrap();
        store.claim_next_job(then).await.unwrap();
        store
            .add_job(&Job::new("live", "sleep 100", Utc::now()))
            .await
            .unwrap();
        store.claim_next_job(Utc::now()).await.unwrap();

        let recovered = scheduler(&store)
            .recover_stale_jobs(Utc::now())
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let stuck = store.get_job("stuck").await.unwrap();
        assert_eq!(stuck.state, JobState::Failed);
        assert_eq!(stuck.attempts, 1);
        assert_eq!(stuck.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert_eq!(
            store.get_job("live").await.unwrap().state,
            JobState::Processing
        );
    }

    #[tokio::test]
    async fn test_retry_dead_job() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.add_job(&Job::new("d", "exit 1", now)).await.unwrap();
        store.claim_next_job(now).await.unwrap();
        store
            .update_job(
                "d",
                JobUpdate::at(now)
                    .state(JobState::Dead)
                    .attempts(3)
                    .error(Some("boom".into())),
            )
            .await
            .unwrap();

        let sched = scheduler(&store);
        let job = sched.retry_dead_job("d").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);

        let err = sched.retry_dead_job("d").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(
            sched.retry_dead_job("missing").await,
            Err(QueueError::NotFound(_))
        ));
    }
}
