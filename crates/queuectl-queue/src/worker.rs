//! Worker pool
//!
//! Each worker is a tokio task looping claim -> execute -> record. Shutdown
//! is cooperative: the cancellation token is only observed between
//! iterations, so a job that was claimed always has its result recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::QueueError;
use crate::registry::{RegistryRecord, WorkerRegistry};
use crate::scheduler::Scheduler;

/// Upper bound on the pause after repeated store errors
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Live view of one worker, shared with the pool
#[derive(Debug, Default)]
pub struct WorkerStatus {
    running: AtomicBool,
    current_job: RwLock<Option<String>>,
    processed: AtomicU64,
    /// Attempts whose result could not be written
    unrecorded: AtomicU64,
}

impl WorkerStatus {
    fn set_current(&self, job_id: Option<String>) {
        if let Ok(mut current) = self.current_job.write() {
            *current = job_id;
        }
    }

    pub fn snapshot(&self, id: usize) -> WorkerSnapshot {
        WorkerSnapshot {
            id,
            running: self.running.load(Ordering::Relaxed),
            current_job: self.current_job.read().ok().and_then(|c| c.clone()),
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_unrecorded: self.unrecorded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub running: bool,
    pub current_job: Option<String>,
    pub jobs_processed: u64,
    #[serde(default)]
    pub jobs_unrecorded: u64,
}

pub struct Worker {
    id: usize,
    scheduler: Arc<Scheduler>,
    poll_interval: Duration,
    status: Arc<WorkerStatus>,
}

impl Worker {
    pub fn new(id: usize, scheduler: Arc<Scheduler>, poll_interval: Duration) -> Self {
        Self {
            id,
            scheduler,
            poll_interval,
            status: Arc::new(WorkerStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<WorkerStatus> {
        self.status.clone()
    }

    /// Process jobs until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        self.status.running.store(true, Ordering::Relaxed);
        info!(worker_id = self.id, "Worker started");

        let mut error_backoff = self.poll_interval;
        while !cancel.is_cancelled() {
            match self.scheduler.get_next_job(Utc::now()).await {
                Ok(Some(job)) => {
                    error_backoff = self.poll_interval;
                    let job_id = job.id.clone();
                    self.status.set_current(Some(job_id.clone()));

                    match self.scheduler.process_job(job).await {
                        Ok(_) => {
                            self.status.processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.status.unrecorded.fetch_add(1, Ordering::Relaxed);
                            error!(worker_id = self.id, job_id = %job_id, error = %e, "Failed to record job result");
                        }
                    }
                    self.status.set_current(None);
                }
                Ok(None) => {
                    error_backoff = self.poll_interval;
                    idle(&cancel, self.poll_interval).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(worker_id = self.id, error = %e, "Store unavailable, backing off");
                    idle(&cancel, error_backoff).await;
                    error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                }
                Err(e) => {
                    error!(worker_id = self.id, error = %e, "Worker iteration failed");
                    idle(&cancel, self.poll_interval).await;
                }
            }
        }

        self.status.running.store(false, Ordering::Relaxed);
        info!(worker_id = self.id, "Worker stopped");
    }
}

async fn idle(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Owns a set of workers sharing one scheduler
pub struct WorkerManager {
    scheduler: Arc<Scheduler>,
    poll_interval: Duration,
    registry: Option<WorkerRegistry>,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
    workers: Vec<(Arc<WorkerStatus>, JoinHandle<()>)>,
    heartbeat: Option<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl WorkerManager {
    pub fn new(scheduler: Arc<Scheduler>, poll_interval: Duration) -> Self {
        Self {
            scheduler,
            poll_interval,
            registry: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
            heartbeat: None,
            started_at: None,
        }
    }

    /// Publish pool state to a registry file while running
    pub fn with_registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Token that stops the pool when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn active_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    pub fn status(&self) -> Vec<WorkerSnapshot> {
        snapshots(&self.workers)
    }

    /// Recover abandoned jobs, then spawn `count` workers. Recovery repeats
    /// on every heartbeat while the pool runs.
    pub async fn start(&mut self, count: usize) -> Result<(), QueueError> {
        if count == 0 {
            return Err(QueueError::Configuration(
                "worker count must be at least 1".into(),
            ));
        }
        if !self.workers.is_empty() {
            return Err(QueueError::Configuration(
                "worker pool is already running".into(),
            ));
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        let recovered = self.scheduler.recover_stale_jobs(Utc::now()).await?;
        if recovered > 0 {
            warn!(recovered, "Recovered jobs abandoned by a previous pool");
        }

        for id in 1..=count {
            let worker = Worker::new(id, self.scheduler.clone(), self.poll_interval);
            let status = worker.status();
            let handle = tokio::spawn(worker.run(self.cancel.clone()));
            self.workers.push((status, handle));
        }
        self.started_at = Some(Utc::now());
        info!(count, store = self.scheduler.store().name(), "Worker pool started");

        if let Some(registry) = &self.registry {
            registry.write(&self.record())?;
        }
        self.heartbeat = Some(self.spawn_heartbeat(self.registry.clone()));
        Ok(())
    }

    fn record(&self) -> RegistryRecord {
        let now = Utc::now();
        RegistryRecord {
            pid: std::process::id(),
            worker_count: self.workers.len(),
            started_at: self.started_at.unwrap_or(now),
            heartbeat_at: now,
            heartbeat_interval_secs: self.heartbeat_interval_secs(),
            workers: self.status(),
            execution: self.scheduler.metrics().snapshot(),
        }
    }

    fn heartbeat_interval_secs(&self) -> u64 {
        self.heartbeat_interval.as_secs().max(1)
    }

    /// Every interval: hand abandoned jobs back to the retry path, then
    /// refresh the registry record if there is one.
    fn spawn_heartbeat(&self, registry: Option<WorkerRegistry>) -> JoinHandle<()> {
        let statuses: Vec<Arc<WorkerStatus>> =
            self.workers.iter().map(|(s, _)| s.clone()).collect();
        let scheduler = self.scheduler.clone();
        let cancel = self.cancel.clone();
        let interval = self.heartbeat_interval;
        let interval_secs = self.heartbeat_interval_secs();
        let started_at = self.started_at.unwrap_or_else(Utc::now);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match scheduler.recover_stale_jobs(Utc::now()).await {
                    Ok(0) => {}
                    Ok(recovered) => warn!(recovered, "Recovered abandoned jobs"),
                    Err(e) => warn!(error = %e, "Stale job recovery failed"),
                }

                let Some(registry) = &registry else {
                    continue;
                };
                let record = RegistryRecord {
                    pid: std::process::id(),
                    worker_count: statuses.len(),
                    started_at,
                    heartbeat_at: Utc::now(),
                    heartbeat_interval_secs: interval_secs,
                    workers: statuses
                        .iter()
                        .enumerate()
                        .map(|(i, s)| s.snapshot(i + 1))
                        .collect(),
                    execution: scheduler.metrics().snapshot(),
                };
                if let Err(e) = registry.write(&record) {
                    warn!(error = %e, "Failed to write worker heartbeat");
                }
            }
        })
    }

    /// Resolve once the shutdown token fires
    pub async fn wait_for_shutdown(&self) {
        self.cancel.cancelled().await;
    }

    /// Signal every worker, wait for in-flight jobs to be recorded, and
    /// clear the registry.
    pub async fn stop(&mut self) -> Result<(), QueueError> {
        self.cancel.cancel();
        info!(count = self.workers.len(), "Stopping worker pool");

        for (_, handle) in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            if let Err(e) = heartbeat.await {
                error!(error = %e, "Heartbeat task panicked");
            }
        }
        if let Some(registry) = &self.registry {
            registry.remove()?;
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

fn snapshots(workers: &[(Arc<WorkerStatus>, JoinHandle<()>)]) -> Vec<WorkerSnapshot> {
    workers
        .iter()
        .enumerate()
        .map(|(i, (status, _))| status.snapshot(i + 1))
        .collect()
}
