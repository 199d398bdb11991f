//! Worker registry file
//!
//! A running pool advertises itself in a small JSON file: its pid, worker
//! snapshots and execution stats, refreshed on every heartbeat. Other
//! processes read it for status output and signal the pid to stop the pool.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::QueueError;
use crate::metrics::ExecutionStats;
use crate::worker::WorkerSnapshot;

/// Missed heartbeats after which a pool is considered gone
pub const MISSED_HEARTBEATS: i32 = 3;

fn default_heartbeat_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub pid: u32,
    pub worker_count: usize,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    pub workers: Vec<WorkerSnapshot>,
    pub execution: ExecutionStats,
}

impl RegistryRecord {
    /// Whether the recorded process still exists
    pub fn is_alive(&self) -> bool {
        process_exists(self.pid)
    }

    /// Whether the last heartbeat is no older than `max_age`
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.heartbeat_at <= max_age
    }

    /// Age beyond which the heartbeat counts as stopped
    pub fn stale_after(&self) -> Duration {
        let interval = i64::try_from(self.heartbeat_interval_secs.max(1)).unwrap_or(i64::MAX);
        Duration::try_seconds(interval.saturating_mul(i64::from(MISSED_HEARTBEATS)))
            .unwrap_or(Duration::MAX)
    }

    /// The pid exists and the pool is still heartbeating. A live pid with a
    /// stopped heartbeat belongs to some other process after pid reuse.
    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.is_fresh(now, self.stale_after()) && self.is_alive()
    }
}

/// What `signal_stop` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGTERM delivered to this pid
    Signalled(u32),
    /// The record pointed at a dead process or a stopped heartbeat and was
    /// removed without signalling anyone
    Stale(u32),
    NotRunning,
}

#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    path: PathBuf,
}

impl WorkerRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the record; readers never observe a partial file
    pub fn write(&self, record: &RegistryRecord) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn read(&self) -> Result<Option<RegistryRecord>, QueueError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record of a running pool, without touching the file
    pub fn read_running(&self) -> Result<Option<RegistryRecord>, QueueError> {
        let now = Utc::now();
        Ok(self.read()?.filter(|record| record.is_running(now)))
    }

    /// Record of a running pool; stale records are removed.
    pub fn read_live(&self) -> Result<Option<RegistryRecord>, QueueError> {
        match self.read()? {
            Some(record) if record.is_running(Utc::now()) => Ok(Some(record)),
            Some(record) => {
                debug!(pid = record.pid, "Removing stale worker registry");
                self.remove()?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self) -> Result<(), QueueError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the recorded pool to shut down gracefully
    pub fn signal_stop(&self) -> Result<StopOutcome, QueueError> {
        let Some(record) = self.read()? else {
            return Ok(StopOutcome::NotRunning);
        };

        if !record.is_running(Utc::now()) {
            debug!(pid = record.pid, "Not signalling stale worker registry");
            self.remove()?;
            return Ok(StopOutcome::Stale(record.pid));
        }

        terminate(record.pid)?;
        info!(pid = record.pid, "Sent stop signal to worker pool");
        Ok(StopOutcome::Signalled(record.pid))
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM means the process exists but belongs to someone else
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<(), QueueError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| QueueError::Validation(format!("invalid pid {}", pid)))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|e| QueueError::Io(std::io::Error::from(e)))
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> Result<(), QueueError> {
    Err(QueueError::Configuration(
        "stopping workers by signal is only supported on unix".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32) -> RegistryRecord {
        let now = Utc::now();
        RegistryRecord {
            pid,
            worker_count: 2,
            started_at: now,
            heartbeat_at: now,
            heartbeat_interval_secs: 5,
            workers: vec![],
            execution: ExecutionStats::default(),
        }
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path().join("workers.json"));

        assert!(registry.read().unwrap().is_none());
        registry.write(&record(std::process::id())).unwrap();

        let read = registry.read().unwrap().unwrap();
        assert_eq!(read.worker_count, 2);
        assert!(read.is_alive());

        registry.remove().unwrap();
        registry.remove().unwrap();
        assert!(registry.read().unwrap().is_none());
    }

    #[test]
    fn test_stop_without_pool() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path().join("workers.json"));
        assert_eq!(registry.signal_stop().unwrap(), StopOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path().join("workers.json"));
        // Above the kernel's pid_max
        registry.write(&record(i32::MAX as u32)).unwrap();

        assert!(registry.read_live().unwrap().is_none());
        assert!(registry.read().unwrap().is_none());

        registry.write(&record(i32::MAX as u32)).unwrap();
        assert_eq!(
            registry.signal_stop().unwrap(),
            StopOutcome::Stale(i32::MAX as u32)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_live_pid_with_old_heartbeat_is_not_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path().join("workers.json"));

        let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut rec = record(bystander.id());
        rec.heartbeat_at = Utc::now() - Duration::hours(1);
        assert!(rec.is_alive());
        assert!(!rec.is_running(Utc::now()));

        registry.write(&rec).unwrap();
        assert!(registry.read_running().unwrap().is_none());
        assert!(registry.read().unwrap().is_some());

        assert_eq!(
            registry.signal_stop().unwrap(),
            StopOutcome::Stale(bystander.id())
        );
        assert!(registry.read().unwrap().is_none());
        assert!(bystander.try_wait().unwrap().is_none());

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[test]
    fn test_stale_after_scales_with_interval() {
        let mut rec = record(std::process::id());
        assert_eq!(rec.stale_after(), Duration::seconds(15));
        rec.heartbeat_interval_secs = 1;
        rec.heartbeat_at = Utc::now() - Duration::seconds(10);
        assert!(!rec.is_running(Utc::now()));
        rec.heartbeat_at = Utc::now();
        assert!(rec.is_running(Utc::now()));
    }

    #[test]
    fn test_heartbeat_freshness() {
        let mut rec = record(1);
        rec.heartbeat_at = Utc::now() - Duration::seconds(60);
        assert!(!rec.is_fresh(Utc::now(), Duration::seconds(15)));
        assert!(rec.is_fresh(Utc::now(), Duration::seconds(120)));
    }
}
