//! SQLite connection setup

use queuectl_queue::QueueError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:queue.db" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode so readers don't block the writer
    pub wal_mode: bool,
    /// How long a statement waits on a locked database before failing
    pub busy_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:queuectl.db".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 5,
        }
    }
}

impl SqliteConfig {
    /// In-memory database (testing). A single connection, since each
    /// connection would otherwise see its own empty database.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    /// Database file at `path`, created if missing
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("sqlite://{}", path.as_ref().display()),
            ..Self::default()
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Open a pool and bring the schema up to date
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, QueueError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| QueueError::Configuration(format!("invalid database url: {}", e)))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

    if config.wal_mode {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
    if config.is_memory() {
        // Dropping the last connection drops the database
        pool_options = pool_options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)?;

    info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| QueueError::Backend(format!("Migration failed: {}", e)))?;

    Ok(pool)
}

/// Classify a driver error; lock contention and pool exhaustion are
/// transient.
pub(crate) fn map_sqlx_error(e: sqlx::Error) -> QueueError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            QueueError::Unavailable(e.to_string())
        }
        sqlx::Error::Database(db) if is_busy_code(db.code().as_deref()) => {
            QueueError::Unavailable(e.to_string())
        }
        _ => QueueError::Backend(e.to_string()),
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, 5 | 6))
}
