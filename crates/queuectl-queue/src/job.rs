//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::QueueError;

/// Longest accepted job id
pub const MAX_ID_LEN: usize = 255;

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in queue
    Pending,
    /// Claimed by a worker and executing
    Processing,
    /// Finished successfully
    Completed,
    /// Failed, waiting for its backoff to elapse
    Failed,
    /// Permanently failed (dead letter queue)
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Edges of the lifecycle state machine. Dead -> Pending is only taken
    /// by an operator DLQ retry.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Failed, Pending)
                | (Dead, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(QueueError::Validation(format!("unknown job state '{}'", other))),
        }
    }
}

/// A persisted job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    /// Concluded failed attempts
    pub attempts: u32,
    pub max_retries: u32,
    /// Higher runs first
    pub priority: i32,
    /// Not claimable before this instant
    pub run_at: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Set only while the job is Failed
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job with the stock defaults
    pub fn new(id: impl Into<String>, command: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            priority: 0,
            run_at: None,
            timeout_secs: crate::config::DEFAULT_TIMEOUT_SECS,
            output: None,
            error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Pending and past its `run_at`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.run_at.map_or(true, |at| at <= now)
    }

    /// Failed and past its `next_retry_at`
    pub fn is_retryable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

/// Partial update applied atomically to one job.
///
/// `updated_at` is always written; stores keep the later of the stored and
/// supplied value so the column never goes backwards.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub attempts: Option<u32>,
    pub output: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub updated_at: DateTime<Utc>,
}

impl JobUpdate {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            state: None,
            attempts: None,
            output: None,
            error: None,
            next_retry_at: None,
            updated_at: now,
        }
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn output(mut self, output: Option<String>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn next_retry_at(mut self, next_retry_at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(next_retry_at);
        self
    }

    /// Apply the update to an in-memory record
    pub fn apply_to(&self, job: &mut Job) {
        if let Some(state) = self.state {
            job.state = state;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(output) = &self.output {
            job.output = output.clone();
        }
        if let Some(error) = &self.error {
            job.error = error.clone();
        }
        if let Some(next_retry_at) = self.next_retry_at {
            job.next_retry_at = next_retry_at;
        }
        job.updated_at = job.updated_at.max(self.updated_at);
    }
}

/// Read-only listing filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Job counts grouped by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub total: u64,
}

impl JobStats {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: JobState, n: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += n;
        self.total += n;
    }
}

/// Raw submission payload, validated into a [`Job`] at the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSubmission {
    pub id: String,
    pub command: String,
    pub max_retries: Option<u32>,
    pub priority: Option<i32>,
    pub run_at: Option<DateTime<Utc>>,
    /// Seconds
    pub timeout: Option<u64>,
}

impl JobSubmission {
    /// Parse a JSON submission. Any decoding problem is a validation error.
    pub fn parse(json: &str) -> Result<Self, QueueError> {
        serde_json::from_str(json).map_err(|e| QueueError::Validation(e.to_string()))
    }

    /// Validate and convert into a pending job, filling defaults from `config`
    pub fn into_job(self, config: &QueueConfig, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(QueueError::Validation("'id' must not be empty".into()));
        }
        if id.len() > MAX_ID_LEN {
            return Err(QueueError::Validation(format!(
                "'id' must be at most {} bytes",
                MAX_ID_LEN
            )));
        }
        if self.command.trim().is_empty() {
            return Err(QueueError::Validation("'command' must not be empty".into()));
        }
        let timeout_secs = self.timeout.unwrap_or(config.default_timeout);
        if timeout_secs == 0 {
            return Err(QueueError::Validation("'timeout' must be positive".into()));
        }

        let mut job = Job::new(id, self.command, now)
            .with_max_retries(self.max_retries.unwrap_or(config.max_retries))
            .with_priority(self.priority.unwrap_or(0))
            .with_timeout_secs(timeout_secs);
        job.run_at = self.run_at;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_state_round_trip_strings() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn test_state_machine_edges() {
        use JobState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Dead));
        assert!(Dead.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Dead));
    }

    #[test]
    fn test_submission_defaults() {
        let config = QueueConfig::default();
        let job = JobSubmission::parse(r#"{"id":"job1","command":"echo hi"}"#)
            .unwrap()
            .into_job(&config, t(0))
            .unwrap();

        assert_eq!(job.id, "job1");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.priority, 0);
        assert_eq!(job.timeout_secs, 300);
        assert!(job.run_at.is_none());
        assert!(job.is_eligible(t(0)));
    }

    #[test]
    fn test_submission_explicit_fields() {
        let config = QueueConfig::default();
        let json = r#"{"id":"j","command":"true","max_retries":0,"priority":-4,
                       "run_at":"2030-01-01T00:00:00Z","timeout":5}"#;
        let job = JobSubmission::parse(json)
            .unwrap()
            .into_job(&config, t(0))
            .unwrap();

        assert_eq!(job.max_retries, 0);
        assert_eq!(job.priority, -4);
        assert_eq!(job.timeout_secs, 5);
        assert!(!job.is_eligible(t(0)));
    }

    #[test]
    fn test_submission_rejects_bad_input() {
        let config = QueueConfig::default();

        assert!(JobSubmission::parse("not json").unwrap_err().is_validation());
        assert!(JobSubmission::parse(r#"{"command":"true"}"#)
            .unwrap_err()
            .is_validation());
        assert!(JobSubmission::parse(r#"{"id":"a","command":"true","max_retries":-1}"#)
            .unwrap_err()
            .is_validation());
        assert!(JobSubmission::parse(r#"{"id":"a","command":"true","colour":"red"}"#)
            .unwrap_err()
            .is_validation());

        let blank = JobSubmission::parse(r#"{"id":"  ","command":"true"}"#).unwrap();
        assert!(blank.into_job(&config, t(0)).unwrap_err().is_validation());

        let no_cmd = JobSubmission::parse(r#"{"id":"a","command":""}"#).unwrap();
        assert!(no_cmd.into_job(&config, t(0)).unwrap_err().is_validation());

        let zero = JobSubmission::parse(r#"{"id":"a","command":"true","timeout":0}"#).unwrap();
        assert!(zero.into_job(&config, t(0)).unwrap_err().is_validation());
    }

    #[test]
    fn test_update_never_moves_updated_at_backwards() {
        let mut job = Job::new("a", "true", t(10));
        JobUpdate::at(t(5)).state(JobState::Processing).apply_to(&mut job);
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.updated_at, t(10));

        JobUpdate::at(t(20))
            .error(Some("boom".into()))
            .next_retry_at(Some(t(22)))
            .apply_to(&mut job);
        assert_eq!(job.updated_at, t(20));
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.next_retry_at, Some(t(22)));
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = JobStats::default();
        stats.add(JobState::Pending, 2);
        stats.add(JobState::Dead, 1);
        assert_eq!(stats.count(JobState::Pending), 2);
        assert_eq!(stats.count(JobState::Dead), 1);
        assert_eq!(stats.total, 3);
    }
}
