//! Durable job store on SQLite
//!
//! Every state change is a single conditional `UPDATE ... RETURNING`, so
//! the database's write lock is the only synchronization workers need,
//! whether they share a process or not.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl_queue::store::is_stale;
use queuectl_queue::{Job, JobFilter, JobState, JobStats, JobStore, JobUpdate, QueueError};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::sqlite::{connect, map_sqlx_error, SqliteConfig};

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| QueueError::Backend(format!("timestamp out of range: {}", value)))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, QueueError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| QueueError::Backend(e.to_string()))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, QueueError> {
    let state: String = column(row, "state")?;
    let state = state
        .parse::<JobState>()
        .map_err(|_| QueueError::Backend(format!("invalid state in database: {}", state)))?;
    let attempts: i64 = column(row, "attempts")?;
    let max_retries: i64 = column(row, "max_retries")?;
    let priority: i64 = column(row, "priority")?;
    let timeout_secs: i64 = column(row, "timeout_secs")?;
    let run_at: Option<i64> = column(row, "run_at")?;
    let next_retry_at: Option<i64> = column(row, "next_retry_at")?;
    let created_at: i64 = column(row, "created_at")?;
    let updated_at: i64 = column(row, "updated_at")?;

    let out_of_range = |field: &str| QueueError::Backend(format!("{} out of range", field));

    Ok(Job {
        id: column(row, "id")?,
        command: column(row, "command")?,
        state,
        attempts: u32::try_from(attempts).map_err(|_| out_of_range("attempts"))?,
        max_retries: u32::try_from(max_retries).map_err(|_| out_of_range("max_retries"))?,
        priority: i32::try_from(priority).map_err(|_| out_of_range("priority"))?,
        run_at: run_at.map(from_micros).transpose()?,
        timeout_secs: u64::try_from(timeout_secs).map_err(|_| out_of_range("timeout_secs"))?,
        output: column(row, "output")?,
        error: column(row, "error")?,
        next_retry_at: next_retry_at.map(from_micros).transpose()?,
        created_at: from_micros(created_at)?,
        updated_at: from_micros(updated_at)?,
    })
}

fn jobs_from_rows(rows: Vec<SqliteRow>) -> Result<Vec<Job>, QueueError> {
    rows.iter().map(job_from_row).collect()
}

/// Durable [`JobStore`] backed by a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap a pool whose schema is already migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect, migrate and wrap
    pub async fn open(config: &SqliteConfig) -> Result<Self, QueueError> {
        Ok(Self::new(connect(config).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Turn an empty conditional write into NotFound or ClaimConflict
    async fn missed_write(&self, id: &str) -> QueueError {
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => QueueError::ClaimConflict(id.to_string()),
            Ok(None) => QueueError::NotFound(id.to_string()),
            Err(e) => map_sqlx_error(e),
        }
    }

    async fn apply_update(
        &self,
        id: &str,
        expected: Option<JobState>,
        update: JobUpdate,
    ) -> Result<Job, QueueError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE jobs SET updated_at = MAX(updated_at, ");
        qb.push_bind(micros(update.updated_at)).push(")");

        if let Some(state) = update.state {
            qb.push(", state = ").push_bind(state.as_str());
        }
        if let Some(attempts) = update.attempts {
            qb.push(", attempts = ").push_bind(i64::from(attempts));
        }
        if let Some(output) = update.output {
            qb.push(", output = ").push_bind(output);
        }
        if let Some(error) = update.error {
            qb.push(", error = ").push_bind(error);
        }
        if let Some(next_retry_at) = update.next_retry_at {
            qb.push(", next_retry_at = ")
                .push_bind(next_retry_at.map(micros));
        }

        qb.push(" WHERE id = ").push_bind(id);
        if let Some(expected) = expected {
            qb.push(" AND state = ").push_bind(expected.as_str());
        }
        qb.push(" RETURNING *");

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => job_from_row(&row),
            None if expected.is_some() => Err(self.missed_write(id).await),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn add_job(&self, job: &Job) -> Result<(), QueueError> {
        let timeout_secs = i64::try_from(job.timeout_secs).unwrap_or(i64::MAX);

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, priority, run_at,
                              timeout_secs, output, error, next_retry_at, created_at, updated_at)
            VALUES (?, ?, 'pending', 0, ?, ?, ?, ?, NULL, NULL, NULL, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(i64::from(job.max_retries))
        .bind(i64::from(job.priority))
        .bind(job.run_at.map(micros))
        .bind(timeout_secs)
        .bind(micros(job.created_at))
        .bind(micros(job.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(QueueError::DuplicateId(job.id.clone()))
            }
            Err(e) => Err(map_sqlx_error(e)),
        }
    }

    async fn get_job(&self, id: &str) -> Result<Job, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        job_from_row(&row)
    }

    async fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let now = micros(now);
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing',
                updated_at = MAX(updated_at, ?)
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending' AND (run_at IS NULL OR run_at <= ?)
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
            )
            AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job, QueueError> {
        self.apply_update(id, None, update).await
    }

    async fn update_job_if(
        &self,
        id: &str,
        expected: JobState,
        update: JobUpdate,
    ) -> Result<Job, QueueError> {
        self.apply_update(id, Some(expected), update).await
    }

    async fn get_retryable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?
            ORDER BY next_retry_at ASC, rowid ASC
            "#,
        )
        .bind(micros(now))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        jobs_from_rows(rows)
    }

    async fn reset_retryable_to_pending(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let now = micros(now);
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', next_retry_at = NULL, updated_at = MAX(updated_at, ?)
            WHERE id = ? AND state = 'failed'
              AND next_retry_at IS NOT NULL AND next_retry_at <= ?
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                debug!(job_id = %id, "Retry reset skipped");
                Err(self.missed_write(id).await)
            }
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs");
        if let Some(state) = filter.state {
            qb.push(" WHERE state = ").push_bind(state.as_str());
        }
        qb.push(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        jobs_from_rows(rows)
    }

    async fn get_stats(&self) -> Result<JobStats, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = column(&row, "state")?;
            let n: i64 = column(&row, "n")?;
            let state = state
                .parse::<JobState>()
                .map_err(|_| QueueError::Backend(format!("invalid state in database: {}", state)))?;
            stats.add(state, u64::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }

    async fn reset_dead_to_pending(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, error = NULL, next_retry_at = NULL,
                updated_at = MAX(updated_at, ?)
            WHERE id = ? AND state = 'dead'
            RETURNING *
            "#,
        )
        .bind(micros(now))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.missed_write(id).await),
        }
    }

    async fn get_stale_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE state = 'processing'")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(jobs_from_rows(rows)?
            .into_iter()
            .filter(|job| is_stale(job, now))
            .collect())
    }
}
