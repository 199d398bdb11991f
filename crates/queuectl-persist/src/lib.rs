//! # queuectl persistence
//!
//! Durable SQLite implementation of the `JobStore` contract.
//!
//! Supports:
//! - In-memory databases (for testing)
//! - File databases in WAL mode, shared safely by several processes

pub mod queue;
pub mod sqlite;

pub use queue::SqliteJobStore;
pub use sqlite::{connect, SqliteConfig};
