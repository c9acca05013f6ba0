//! Job outcome writes.
//!
//! The executor persists every outcome as a [`JobUpdate`] so that the same
//! value can be buffered during an outage and replayed later. Terminal
//! updates always clear `worker_id` (an `executing` row is the only kind
//! that carries one), and updates carrying an error append a `job_errors`
//! row in the same transaction.

use async_trait::async_trait;
use sqlx::PgPool;

use workhorse_core::JobId;
use workhorse_core::job::{JobRecord, JobStatus};

use crate::error::DbResult;

/// A job write, applied immediately or buffered while the database is
/// unreachable.
///
/// Merging two updates takes the union of their fields with the later value
/// winning per field; the destroy sentinel lives a level up, in the worker's
/// pending-update buffer, and absorbs everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub runtime: Option<f64>,
    pub error: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn completed(runtime: f64) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            runtime: Some(runtime),
            error: None,
        }
    }

    pub fn failed(runtime: f64, error: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            runtime: Some(runtime),
            error: Some(error),
        }
    }

    pub fn discarded(runtime: Option<f64>, error: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Discarded),
            runtime,
            error: Some(error),
        }
    }

    pub fn released() -> Self {
        Self {
            status: Some(JobStatus::Pending),
            runtime: None,
            error: None,
        }
    }

    /// Merge a later update into this one.
    pub fn merge(&mut self, later: JobUpdate) {
        if later.status.is_some() {
            self.status = later.status;
        }
        if later.runtime.is_some() {
            self.runtime = later.runtime;
        }
        if later.error.is_some() {
            self.error = later.error;
        }
    }
}

/// Persistence operations on job rows, as used by the worker runtime.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Apply a [`JobUpdate`]. A no-op when the row no longer exists.
    async fn apply_update(&self, id: JobId, update: &JobUpdate) -> DbResult<()>;

    /// Delete the row outright (the `delete_*_jobs` settings). The error log
    /// cascades away with it.
    async fn destroy(&self, id: JobId) -> DbResult<()>;

    /// Return a claimed row to `pending` with no owner.
    async fn release(&self, id: JobId) -> DbResult<()>;

    async fn find(&self, id: JobId) -> DbResult<Option<JobRecord>>;
}

/// PostgreSQL implementation of [`JobRepo`].
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn apply_update(&self, id: JobId, update: &JobUpdate) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = COALESCE($2, status),
                runtime = COALESCE($3, runtime),
                worker_id = CASE WHEN $2 IS NOT NULL AND $2 <> 'e' THEN NULL ELSE worker_id END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status)
        .bind(update.runtime)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() > 0 {
            if let Some(error) = &update.error {
                sqlx::query("INSERT INTO job_errors (job_id, error) VALUES ($1, $2)")
                    .bind(id)
                    .bind(error)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn destroy(&self, id: JobId) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, id: JobId) -> DbResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'p', worker_id = NULL WHERE id = $1 AND status = 'e'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: JobId) -> DbResult<Option<JobRecord>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, queue, priority, enqueued_at, scheduled_at, active_job_id,
                   payload, options, status, runtime, worker_id
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
