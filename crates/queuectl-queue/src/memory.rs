//! In-memory job store with the same claim semantics as the durable one

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::QueueError;
use crate::job::{Job, JobFilter, JobState, JobStats, JobUpdate};
use crate::store::{is_stale, JobStore};

#[derive(Debug, Clone)]
struct Slot {
    job: Job,
    /// Insertion order, tie-breaker behind `created_at`
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, Slot>,
    next_seq: u64,
}

/// Jobs kept in a map behind one lock; every operation is a critical
/// section, so conditional writes are trivially atomic.
#[derive(Debug, Default, Clone)]
pub struct MemoryJobStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(QueueError::DuplicateId(job.id.clone()));
        }

        let mut job = job.clone();
        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_retry_at = None;
        job.output = None;
        job.error = None;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.id.clone(), Slot { job, seq });
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job, QueueError> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(id)
            .map(|slot| slot.job.clone())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.write().await;

        let best = inner
            .jobs
            .values()
            .filter(|slot| slot.job.is_eligible(now))
            .min_by_key(|slot| (Reverse(slot.job.priority), slot.job.created_at, slot.seq))
            .map(|slot| slot.job.id.clone());

        let Some(id) = best else {
            return Ok(None);
        };
        let slot = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        JobUpdate::at(now)
            .state(JobState::Processing)
            .apply_to(&mut slot.job);
        Ok(Some(slot.job.clone()))
    }

    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job, QueueError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        update.apply_to(&mut slot.job);
        Ok(slot.job.clone())
    }

    async fn update_job_if(
        &self,
        id: &str,
        expected: JobState,
        update: JobUpdate,
    ) -> Result<Job, QueueError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if slot.job.state != expected {
            return Err(QueueError::ClaimConflict(id.to_string()));
        }
        update.apply_to(&mut slot.job);
        Ok(slot.job.clone())
    }

    async fn get_retryable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|slot| slot.job.is_retryable(now))
            .map(|slot| slot.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.next_retry_at);
        Ok(jobs)
    }

    async fn reset_retryable_to_pending(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !slot.job.is_retryable(now) {
            return Err(QueueError::ClaimConflict(id.to_string()));
        }
        JobUpdate::at(now)
            .state(JobState::Pending)
            .next_retry_at(None)
            .apply_to(&mut slot.job);
        Ok(slot.job.clone())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let inner = self.inner.read().await;
        let mut slots: Vec<&Slot> = inner
            .jobs
            .values()
            .filter(|slot| filter.state.map_or(true, |state| slot.job.state == state))
            .collect();
        slots.sort_by_key(|slot| Reverse((slot.job.created_at, slot.seq)));

        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
        Ok(slots
            .into_iter()
            .take(limit)
            .map(|slot| slot.job.clone())
            .collect())
    }

    async fn get_stats(&self) -> Result<JobStats, QueueError> {
        let inner = self.inner.read().await;
        let mut stats = JobStats::default();
        for slot in inner.jobs.values() {
            stats.add(slot.job.state, 1);
        }
        Ok(stats)
    }

    async fn reset_dead_to_pending(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if slot.job.state != JobState::Dead {
            return Err(QueueError::ClaimConflict(id.to_string()));
        }
        JobUpdate::at(now)
            .state(JobState::Pending)
            .attempts(0)
            .error(None)
            .next_retry_at(None)
            .apply_to(&mut slot.job);
        Ok(slot.job.clone())
    }

    async fn get_stale_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|slot| is_stale(&slot.job, now))
            .map(|slot| slot.job.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_claim() {
        let store = MemoryJobStore::new();
        store.add_job(&Job::new("a", "true", t(0))).await.unwrap();

        let job = store.claim_next_job(t(1)).await.unwrap().expect("job");
        assert_eq!(job.id, "a");
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.updated_at, t(1));

        assert!(store.claim_next_job(t(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_starts_from_clean_record() {
        let store = MemoryJobStore::new();
        let mut job = Job::new("a", "true", t(0));
        job.state = JobState::Dead;
        job.attempts = 4;
        job.output = Some("old output".into());
        job.error = Some("old error".into());
        job.next_retry_at = Some(t(10));
        store.add_job(&job).await.unwrap();

        let stored = store.get_job("a").await.unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.output, None);
        assert_eq!(stored.error, None);
        assert_eq!(stored.next_retry_at, None);
    }

    #[tokio::test]
    async fn test_duplicate_id_leaves_store_unchanged() {
        let store = MemoryJobStore::new();
        store.add_job(&Job::new("a", "echo one", t(0))).await.unwrap();

        let err = store
            .add_job(&Job::new("a", "echo two", t(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateId(id) if id == "a"));
        assert_eq!(store.get_job("a").await.unwrap().command, "echo one");
        assert_eq!(store.get_stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let store = MemoryJobStore::new();
        store
            .add_job(&Job::new("old-low", "true", t(0)).with_priority(1))
            .await
            .unwrap();
        store
            .add_job(&Job::new("new-high", "true", t(1)).with_priority(10))
            .await
            .unwrap();
        store
            .add_job(&Job::new("newer-high", "true", t(2)).with_priority(10))
            .await
            .unwrap();

        let order: Vec<String> = [
            store.claim_next_job(t(5)).await.unwrap(),
            store.claim_next_job(t(5)).await.unwrap(),
            store.claim_next_job(t(5)).await.unwrap(),
        ]
        .into_iter()
        .map(|job| job.unwrap().id)
        .collect();
        assert_eq!(order, vec!["new-high", "newer-high", "old-low"]);
    }

    #[tokio::test]
    async fn test_scheduled_job_waits_for_run_at() {
        let store = MemoryJobStore::new();
        store
            .add_job(&Job::new("later", "true", t(0)).with_run_at(t(60)))
            .await
            .unwrap();

        assert!(store.claim_next_job(t(59)).await.unwrap().is_none());
        assert!(store.claim_next_job(t(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_reset_respects_next_retry_at() {
        let store = MemoryJobStore::new();
        store.add_job(&Job::new("a", "exit 1", t(0))).await.unwrap();
        store.claim_next_job(t(0)).await.unwrap();
        store
            .update_job(
                "a",
                JobUpdate::at(t(1))
                    .state(JobState::Failed)
                    .attempts(1)
                    .next_retry_at(Some(t(3))),
            )
            .await
            .unwrap();

        assert!(store.get_retryable_jobs(t(2)).await.unwrap().is_empty());
        let early = store.reset_retryable_to_pending("a", t(2)).await.unwrap_err();
        assert!(early.is_conflict());
        assert_eq!(store.get_job("a").await.unwrap().state, JobState::Failed);

        assert_eq!(store.get_retryable_jobs(t(3)).await.unwrap().len(), 1);
        let job = store.reset_retryable_to_pending("a", t(3)).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.next_retry_at.is_none());

        let again = store.reset_retryable_to_pending("a", t(4)).await.unwrap_err();
        assert!(again.is_conflict());
    }

    #[tokio::test]
    async fn test_dlq_reset() {
        let store = MemoryJobStore::new();
        store.add_job(&Job::new("a", "exit 1", t(0))).await.unwrap();
        assert!(store
            .reset_dead_to_pending("a", t(1))
            .await
            .unwrap_err()
            .is_conflict());

        store
            .update_job(
                "a",
                JobUpdate::at(t(1))
                    .state(JobState::Dead)
                    .attempts(3)
                    .error(Some("boom".into())),
            )
            .await
            .unwrap();
        assert_eq!(store.get_dlq_jobs().await.unwrap().len(), 1);

        let job = store.reset_dead_to_pending("a", t(2)).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.error.is_none());
        assert!(store.get_dlq_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let store = MemoryJobStore::new();
        for i in 0..5 {
            store
                .add_job(&Job::new(format!("j{}", i), "true", t(i)))
                .await
                .unwrap();
        }

        let jobs = store.list_jobs(&JobFilter::all().limit(2)).await.unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["j4", "j3"]);

        let pending = store
            .list_jobs(&JobFilter::state(JobState::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 5);
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let store = MemoryJobStore::new();
        store
            .add_job(&Job::new("a", "sleep 100", t(0)).with_timeout_secs(10))
            .await
            .unwrap();
        store.claim_next_job(t(0)).await.unwrap();

        let deadline = t(0) + Duration::seconds(10 + crate::store::STALE_GRACE_SECS);
        assert!(store
            .get_stale_jobs(deadline - Duration::seconds(1))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.get_stale_jobs(deadline).await.unwrap().len(), 1);
    }
}
