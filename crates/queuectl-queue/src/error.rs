//! Queue error taxonomy

/// Errors surfaced by the store, the scheduler and the worker pool.
///
/// Execution failures of a job's command are not errors: they are absorbed
/// by the retry state machine (see [`crate::executor::ExecutionOutcome`]).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Malformed job submission, rejected before persistence
    #[error("Invalid job: {0}")]
    Validation(String),

    /// A job with this id already exists
    #[error("Job '{0}' already exists")]
    DuplicateId(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    /// A conditional write lost the race to another caller
    #[error("Job '{0}' was claimed or changed concurrently")]
    ClaimConflict(String),

    /// Transient store failure (lock contention, pool exhaustion, I/O)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid startup option
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the failed operation may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether this is a benign lost race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ClaimConflict(_))
    }

    /// Whether the submission itself was rejected.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::DuplicateId(_))
    }
}
