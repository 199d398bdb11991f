//! Retry backoff and the outcome -> transition rules

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutionOutcome;
use crate::job::{Job, JobState, JobUpdate};

/// Longest delay ever scheduled
const MAX_DELAY_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// Exponential retry backoff: attempt `k` waits `base^k` seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: f64,
}

impl BackoffPolicy {
    pub fn new(base: f64) -> Self {
        Self { base }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = self
            .base
            .powi(attempt.min(i32::MAX as u32) as i32)
            .min(MAX_DELAY_SECS);
        Duration::milliseconds((secs * 1000.0).round() as i64)
    }
}

/// Where a finished attempt sends the job
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Completed,
    RetryAt { attempts: u32, at: DateTime<Utc> },
    DeadLetter { attempts: u32 },
}

/// Decide the next state of a Processing job after an attempt concluded,
/// and the partial update that records it.
pub fn plan_transition(
    job: &Job,
    outcome: &ExecutionOutcome,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> (Transition, JobUpdate) {
    let output = outcome.output().filter(|o| !o.is_empty()).map(str::to_owned);
    let update = JobUpdate::at(now).output(output);

    match outcome {
        ExecutionOutcome::Succeeded { .. } => (
            Transition::Completed,
            update
                .state(JobState::Completed)
                .error(None)
                .next_retry_at(None),
        ),
        ExecutionOutcome::Failed { .. } | ExecutionOutcome::TimedOut { .. } => {
            let attempts = job.attempts.saturating_add(1);
            let error = Some(outcome.error_message());

            if attempts < job.max_retries {
                let at = now + backoff.delay(attempts);
                (
                    Transition::RetryAt { attempts, at },
                    update
                        .state(JobState::Failed)
                        .attempts(attempts)
                        .error(error)
                        .next_retry_at(Some(at)),
                )
            } else {
                (
                    Transition::DeadLetter { attempts },
                    update
                        .state(JobState::Dead)
                        .attempts(attempts)
                        .error(error)
                        .next_retry_at(None),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn failed() -> ExecutionOutcome {
        ExecutionOutcome::Failed {
            exit_code: Some(1),
            output: String::new(),
            error: "Command failed with exit code 1".into(),
        }
    }

    #[test]
    fn test_backoff_law() {
        let policy = BackoffPolicy::new(2.0);
        assert_eq!(policy.delay(0), Duration::seconds(1));
        assert_eq!(policy.delay(1), Duration::seconds(2));
        assert_eq!(policy.delay(2), Duration::seconds(4));
        assert_eq!(policy.delay(3), Duration::seconds(8));

        for k in 1..10 {
            assert!(policy.delay(k + 1) > policy.delay(k));
        }
    }

    #[test]
    fn test_backoff_fractional_base_and_cap() {
        assert_eq!(BackoffPolicy::new(1.5).delay(2), Duration::milliseconds(2250));
        assert_eq!(BackoffPolicy::new(1.0).delay(7), Duration::seconds(1));
        assert_eq!(
            BackoffPolicy::new(10.0).delay(400),
            Duration::seconds(30 * 24 * 3600)
        );
    }

    #[test]
    fn test_success_completes_without_counting_attempt() {
        let job = Job::new("a", "true", now());
        let outcome = ExecutionOutcome::Succeeded {
            output: "ok\n".into(),
        };
        let (transition, update) = plan_transition(&job, &outcome, &BackoffPolicy::new(2.0), now());

        assert_eq!(transition, Transition::Completed);
        assert_eq!(update.state, Some(JobState::Completed));
        assert_eq!(update.attempts, None);
        assert_eq!(update.error, Some(None));
        assert_eq!(update.output, Some(Some("ok\n".into())));
    }

    #[test]
    fn test_failure_schedules_retry_then_dead_letters() {
        let policy = BackoffPolicy::new(2.0);
        let mut job = Job::new("a", "exit 1", now()).with_max_retries(2);
        job.state = JobState::Processing;

        let (transition, update) = plan_transition(&job, &failed(), &policy, now());
        assert_eq!(
            transition,
            Transition::RetryAt {
                attempts: 1,
                at: now() + Duration::seconds(2)
            }
        );
        assert_eq!(update.state, Some(JobState::Failed));
        assert_eq!(update.next_retry_at, Some(Some(now() + Duration::seconds(2))));

        job.attempts = 1;
        let (transition, update) = plan_transition(&job, &failed(), &policy, now());
        assert_eq!(transition, Transition::DeadLetter { attempts: 2 });
        assert_eq!(update.state, Some(JobState::Dead));
        assert_eq!(update.next_retry_at, Some(None));
        assert_eq!(
            update.error,
            Some(Some("Command failed with exit code 1".into()))
        );
    }

    #[test]
    fn test_zero_retries_goes_straight_to_dlq() {
        let job = Job::new("a", "exit 1", now()).with_max_retries(0);
        let (transition, _) = plan_transition(&job, &failed(), &BackoffPolicy::new(2.0), now());
        assert_eq!(transition, Transition::DeadLetter { attempts: 1 });
    }

    #[test]
    fn test_timeout_follows_failure_path() {
        let job = Job::new("a", "sleep 10", now()).with_max_retries(3);
        let outcome = ExecutionOutcome::TimedOut { timeout_secs: 1 };
        let (transition, update) = plan_transition(&job, &outcome, &BackoffPolicy::new(2.0), now());

        assert!(matches!(transition, Transition::RetryAt { attempts: 1, .. }));
        assert_eq!(
            update.error,
            Some(Some("execution timed out after 1 seconds".into()))
        );
    }
}
