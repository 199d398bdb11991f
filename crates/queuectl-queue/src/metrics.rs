//! Execution metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::QueueError;
use crate::job::{JobState, JobStats};
use crate::store::JobStore;

/// Observational recorder of attempt durations. Nothing reads it to make
/// scheduling decisions.
#[derive(Debug)]
pub struct Metrics {
    executions: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            executions: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one concluded attempt
    pub fn record_execution(&self, duration: Duration, success: bool) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.executions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.min_micros.fetch_min(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutionStats {
        let total = self.executions.load(Ordering::Relaxed);
        if total == 0 {
            return ExecutionStats::default();
        }
        let secs = |micros: u64| micros as f64 / 1_000_000.0;
        ExecutionStats {
            total_executions: total,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_execution_secs: secs(self.total_micros.load(Ordering::Relaxed)) / total as f64,
            min_execution_secs: secs(self.min_micros.load(Ordering::Relaxed)),
            max_execution_secs: secs(self.max_micros.load(Ordering::Relaxed)),
        }
    }

    /// Execution stats alongside the store's state counts
    pub async fn report(&self, store: &dyn JobStore) -> Result<MetricsReport, QueueError> {
        Ok(MetricsReport {
            jobs: store.get_stats().await?,
            execution: self.snapshot(),
            generated_at: Utc::now(),
        })
    }
}

/// Aggregated attempt durations
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_execution_secs: f64,
    pub min_execution_secs: f64,
    pub max_execution_secs: f64,
}

impl ExecutionStats {
    /// Export in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP queuectl_executions_total Concluded job attempts\n");
        output.push_str("# TYPE queuectl_executions_total counter\n");
        output.push_str(&format!(
            "queuectl_executions_total{{result=\"success\"}} {}\n",
            self.succeeded
        ));
        output.push_str(&format!(
            "queuectl_executions_total{{result=\"failure\"}} {}\n",
            self.failed
        ));

        output.push_str("# HELP queuectl_execution_seconds Attempt duration\n");
        output.push_str("# TYPE queuectl_execution_seconds gauge\n");
        output.push_str(&format!(
            "queuectl_execution_seconds{{stat=\"avg\"}} {:.6}\n",
            self.avg_execution_secs
        ));
        output.push_str(&format!(
            "queuectl_execution_seconds{{stat=\"min\"}} {:.6}\n",
            self.min_execution_secs
        ));
        output.push_str(&format!(
            "queuectl_execution_seconds{{stat=\"max\"}} {:.6}\n",
            self.max_execution_secs
        ));

        output
    }
}

/// Point-in-time view for status surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub jobs: JobStats,
    pub execution: ExecutionStats,
    pub generated_at: DateTime<Utc>,
}

impl MetricsReport {
    /// Execution stats plus one gauge per job state
    pub fn to_prometheus(&self) -> String {
        let mut output = self.execution.to_prometheus();

        output.push_str("# HELP queuectl_jobs Jobs currently in each state\n");
        output.push_str("# TYPE queuectl_jobs gauge\n");
        for state in JobState::ALL {
            output.push_str(&format!(
                "queuectl_jobs{{state=\"{}\"}} {}\n",
                state,
                self.jobs.count(state)
            ));
        }

        output
    }
}
