use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use oncall_core::{JobId, JobStatus, RetryPolicy};

use crate::{is_transient, to_rfc3339};

const COLUMNS: &str = "\
    id, queue, name, args_json, retry_policy_json, status, attempts, \
    run_at, locked_at, last_error, created_at, updated_at";

/// Repository for the durable `jobs` queue.
#[derive(Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persists a new job in `QUEUED` state.
    pub async fn enqueue(&self, job: &NewJob<'_>) -> Result<JobId, JobError> {
        let retry_json = serde_json::to_string(job.retry).map_err(JobError::Encode)?;
        let created_at = to_rfc3339(job.created_at);
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO jobs \
             (queue, name, args_json, retry_policy_json, status, attempts, run_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?) \
             RETURNING id",
        )
        .bind(job.queue)
        .bind(job.name)
        .bind(job.args_json)
        .bind(retry_json)
        .bind(JobStatus::Queued.as_str())
        .bind(to_rfc3339(job.run_at))
        .bind(&created_at)
        .bind(&created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobId(id))
    }

    /// Atomically leases the oldest due job of `queue`, bumping its attempt counter.
    ///
    /// The select and the update run as one statement, so two workers never
    /// lease the same row.
    pub async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, JobError> {
        let now = to_rfc3339(now);
        let query = format!(
            "UPDATE jobs \
             SET status = ?, attempts = attempts + 1, locked_at = ?, updated_at = ? \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE queue = ? AND status = ? AND run_at <= ? \
                 ORDER BY run_at ASC, id ASC \
                 LIMIT 1 \
             ) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(JobStatus::Running.as_str())
            .bind(&now)
            .bind(&now)
            .bind(queue)
            .bind(JobStatus::Queued.as_str())
            .bind(&now)
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRow::into_domain).transpose()
    }

    /// Marks a leased job as done. Returns `false` when the lease was lost.
    pub async fn mark_succeeded(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, locked_at = NULL, last_error = NULL, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Succeeded.as_str())
        .bind(to_rfc3339(now))
        .bind(id.get())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns a leased job to the queue, due at `run_at`.
    pub async fn schedule_retry(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, run_at = ?, locked_at = NULL, last_error = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Queued.as_str())
        .bind(to_rfc3339(run_at))
        .bind(error)
        .bind(to_rfc3339(now))
        .bind(id.get())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves a leased job to the dead-letter state.
    pub async fn mark_dead(
        &self,
        id: JobId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, locked_at = NULL, last_error = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(JobStatus::Dead.as_str())
        .bind(error)
        .bind(to_rfc3339(now))
        .bind(id.get())
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Re-queues jobs whose lease is older than `locked_before`, e.g. after a worker crash.
    pub async fn requeue_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, JobError> {
        let now = to_rfc3339(now);
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, run_at = ?, locked_at = NULL, updated_at = ? \
             WHERE status = ? AND locked_at < ?",
        )
        .bind(JobStatus::Queued.as_str())
        .bind(&now)
        .bind(&now)
        .bind(JobStatus::Running.as_str())
        .bind(to_rfc3339(locked_before))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Loads a job by id.
    pub async fn fetch(&self, id: JobId) -> Result<JobRecord, JobError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobError::NotFound)?
            .into_domain()
    }

    /// Lists jobs with the given name, oldest first.
    pub async fn list_by_name(&self, name: &str) -> Result<Vec<JobRecord>, JobError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE name = ? ORDER BY id ASC");
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(name)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobRow::into_domain).collect()
    }

    /// Counts the jobs of `queue` in `status`.
    pub async fn count_by_status(&self, queue: &str, status: JobStatus) -> Result<u64, JobError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE queue = ? AND status = ?")
                .bind(queue)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }
}

/// Parameters required to enqueue a job.
pub struct NewJob<'a> {
    pub queue: &'a str,
    pub name: &'a str,
    pub args_json: &'a str,
    pub retry: &'a RetryPolicy,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A persisted job, as leased by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub args_json: String,
    pub retry: RetryPolicy,
    pub status: JobStatus,
    /// Deliveries so far, including the current one.
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Retries already spent before the current attempt.
    pub fn retries_so_far(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    queue: String,
    name: String,
    args_json: String,
    retry_policy_json: String,
    status: String,
    attempts: i64,
    run_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_domain(self) -> Result<JobRecord, JobError> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| JobError::InvalidRow(format!("unknown status {}", self.status)))?;
        let retry = serde_json::from_str(&self.retry_policy_json)
            .map_err(|err| JobError::InvalidRow(format!("invalid retry policy: {err}")))?;

        Ok(JobRecord {
            id: JobId(self.id),
            queue: self.queue,
            name: self.name,
            args_json: self.args_json,
            retry,
            status,
            attempts: self.attempts.max(0) as u32,
            run_at: self.run_at,
            locked_at: self.locked_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Errors that can occur while operating on the job queue.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found")]
    NotFound,
    #[error("failed to encode retry policy: {0}")]
    Encode(serde_json::Error),
    #[error("invalid job row: {0}")]
    InvalidRow(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(err) if is_transient(err))
    }
}
