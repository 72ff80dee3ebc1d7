//! Processing job queue backed by PostgreSQL.
//!
//! Delivery is at-least-once. A job is claimed with `FOR UPDATE SKIP LOCKED`
//! so concurrent workers never receive the same row, and it leaves the
//! pending set only when acknowledged or dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use inkwell_core::{
    new_v7, Error, FailOutcome, JobQueue, JobStatus, ProcessingJob, QueuedJob, Result,
    RetryPolicy,
};

const JOB_COLUMNS: &str = "id, page_id, image_ref, status::text AS status, attempts, max_attempts, \
     run_at, last_error, created_at, started_at, completed_at";

/// PostgreSQL implementation of JobQueue.
pub struct PgJobQueue {
    pool: Pool<Postgres>,
    policy: RetryPolicy,
    /// Wakes idle workers as soon as a job is enqueued.
    notify: Arc<Notify>,
}

impl PgJobQueue {
    /// Create a new queue with the default retry policy.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    /// Create a new queue with an explicit retry policy.
    pub fn with_policy(pool: Pool<Postgres>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Get the job notification handle for event-driven waking.
    pub fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Retry policy applied to newly enqueued jobs and failures.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn parse_job_row(row: &PgRow) -> Result<QueuedJob> {
        let status: String = row.get("status");
        Ok(QueuedJob {
            id: row.get("id"),
            payload: ProcessingJob {
                page_id: row.get("page_id"),
                image_ref: row.get("image_ref"),
            },
            status: status.parse::<JobStatus>()?,
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            run_at: row.get("run_at"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: ProcessingJob) -> Result<Uuid> {
        let job_id = new_v7();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO processing_job (id, page_id, image_ref, status, attempts, max_attempts, run_at, created_at)
             VALUES ($1, $2, $3, 'pending'::processing_job_status, 0, $4, $5, $5)",
        )
        .bind(job_id)
        .bind(job.page_id)
        .bind(&job.image_ref)
        .bind(self.policy.max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(job_id = %job_id, page_id = %job.page_id, "Job enqueued");
        self.notify.notify_waiters();
        Ok(job_id)
    }

    async fn claim_next(&self) -> Result<Option<QueuedJob>> {
        let now = Utc::now();

        let row = sqlx::query(&format!(
            "UPDATE processing_job
             SET status = 'running'::processing_job_status, attempts = attempts + 1, started_at = $1
             WHERE id = (
                 SELECT id FROM processing_job
                 WHERE status = 'pending'::processing_job_status AND run_at <= $1
                 ORDER BY run_at ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE processing_job
             SET status = 'completed'::processing_job_status, completed_at = $2, last_error = NULL
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Job {}", job_id)));
        }
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let counts: Option<(i32, i32)> = sqlx::query_as(
            "SELECT attempts, max_attempts FROM processing_job WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let Some((attempts, max_attempts)) = counts else {
            return Err(Error::NotFound(format!("Job {}", job_id)));
        };

        let outcome = if attempts < max_attempts {
            let delay = chrono::Duration::from_std(self.policy.delay_for_attempt(attempts))
                .map_err(|e| Error::Internal(format!("Retry delay out of range: {}", e)))?;
            let run_at = now + delay;

            sqlx::query(
                "UPDATE processing_job
                 SET status = 'pending'::processing_job_status, run_at = $2, last_error = $3,
                     started_at = NULL
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(run_at)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            FailOutcome::Retry {
                attempt: attempts,
                run_at,
            }
        } else {
            sqlx::query(
                "UPDATE processing_job
                 SET status = 'dead'::processing_job_status, completed_at = $2, last_error = $3
                 WHERE id = $1",
            )
            .bind(job_id)
            .bind(now)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            FailOutcome::DeadLettered { attempts }
        };

        tx.commit().await.map_err(Error::Database)?;
        Ok(outcome)
    }

    async fn dead_letter(&self, job_id: Uuid, error: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE processing_job
             SET status = 'dead'::processing_job_status, completed_at = $2, last_error = $3
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(Utc::now())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Job {}", job_id)));
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<QueuedJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_job WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processing_job WHERE status = 'pending'::processing_job_status",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn list_dead(&self, limit: i64) -> Result<Vec<QueuedJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM processing_job
             WHERE status = 'dead'::processing_job_status
             ORDER BY completed_at DESC NULLS LAST
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_job_row).collect()
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| Error::InvalidInput(format!("Stale threshold out of range: {}", e)))?;

        let result = sqlx::query(
            "UPDATE processing_job
             SET status = 'pending'::processing_job_status, started_at = NULL, run_at = now()
             WHERE status = 'running'::processing_job_status AND started_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(
                subsystem = "jobs",
                component = "queue",
                op = "requeue_stale",
                count = requeued,
                "Re-queued orphaned running jobs"
            );
            self.notify.notify_waiters();
        } else {
            debug!(
                subsystem = "jobs",
                component = "queue",
                op = "requeue_stale",
                "No orphaned jobs found"
            );
        }
        Ok(requeued)
    }
}
