//! # queuectl queue
//!
//! Job lifecycle engine for a single-machine background job queue.
//!
//! Features:
//! - Shell-command jobs with priority, delayed start and per-job timeout
//! - Pluggable `JobStore` with atomic claims (in-memory here, SQLite in
//!   `queuectl-persist`)
//! - Exponential retry backoff and a dead letter queue
//! - Cooperative worker pool with graceful shutdown and a registry file

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::QueueConfig;
pub use error::QueueError;
pub use events::{EventFeed, JobEvent};
pub use executor::{CommandExecutor, ExecutionOutcome};
pub use job::{Job, JobFilter, JobState, JobStats, JobSubmission, JobUpdate};
pub use memory::MemoryJobStore;
pub use metrics::{ExecutionStats, Metrics, MetricsReport};
pub use registry::{RegistryRecord, StopOutcome, WorkerRegistry};
pub use retry::{BackoffPolicy, Transition};
pub use scheduler::Scheduler;
pub use store::JobStore;
pub use worker::{WorkerManager, WorkerSnapshot};
