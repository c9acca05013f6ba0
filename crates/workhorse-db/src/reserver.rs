//! The reserver: atomic, skip-locked claiming of ready jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use workhorse_core::job::ReservedJob;
use workhorse_core::{JobFilter, JobId, WorkerId};

use crate::error::DbResult;

/// Claims ready jobs for one worker.
///
/// A trait so the provider can be exercised against an in-memory fake; the
/// production implementation is [`PgReserver`].
#[async_trait]
pub trait Reserver: Send + Sync {
    /// Atomically claim up to `limit` ready jobs for this worker.
    ///
    /// One statement: select the smallest ready rows by
    /// (`priority`, `scheduled_at`, `enqueued_at`), skipping rows locked by
    /// concurrent transactions, and flip them to `executing` owned by this
    /// worker.
    async fn reserve(&self, limit: usize) -> DbResult<Vec<ReservedJob>>;

    /// Rows still marked `executing` by this worker whose ids are not in
    /// `active_ids`. These are claims from a previous run of this worker and
    /// are re-dispatched at startup.
    async fn abandoned(&self, active_ids: &[JobId]) -> DbResult<Vec<ReservedJob>>;

    /// The earliest `scheduled_at` among pending rows matching the worker's
    /// filter, or `None` when no such row exists.
    async fn earliest_scheduled_at(&self) -> DbResult<Option<DateTime<Utc>>>;

    /// Return claimed rows to `pending` in one statement. Used when dispatch
    /// fails after reservation.
    async fn release(&self, ids: &[JobId]) -> DbResult<u64>;
}

/// PostgreSQL implementation of [`Reserver`] using `FOR UPDATE SKIP LOCKED`.
pub struct PgReserver {
    pool: PgPool,
    worker_id: WorkerId,
    filter: JobFilter,
}

impl PgReserver {
    pub fn new(pool: PgPool, worker_id: WorkerId, filter: JobFilter) -> Self {
        Self {
            pool,
            worker_id,
            filter,
        }
    }

    pub fn filter(&self) -> &JobFilter {
        &self.filter
    }
}

#[async_trait]
impl Reserver for PgReserver {
    async fn reserve(&self, limit: usize) -> DbResult<Vec<ReservedJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, ReservedJob>(
            r#"
            WITH ready AS (
                SELECT id
                FROM jobs
                WHERE status = 'p'
                  AND scheduled_at <= now()
                  AND ($2::text[] IS NULL OR queue = ANY($2))
                  AND priority BETWEEN $3 AND $4
                ORDER BY priority ASC, scheduled_at ASC, enqueued_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'e', worker_id = $5
            FROM ready
            WHERE jobs.id = ready.id
            RETURNING jobs.id, jobs.active_job_id, jobs.payload, jobs.options, jobs.scheduled_at
            "#,
        )
        .bind(limit as i64)
        .bind(self.filter.queue_names())
        .bind(self.filter.min_priority())
        .bind(self.filter.max_priority())
        .bind(self.worker_id)
        .fetch_all(&self.pool)
        .await?;

        if !jobs.is_empty() {
            debug!(count = jobs.len(), worker_id = %self.worker_id, "reserved jobs");
        }
        Ok(jobs)
    }

    async fn abandoned(&self, active_ids: &[JobId]) -> DbResult<Vec<ReservedJob>> {
        let jobs = sqlx::query_as::<_, ReservedJob>(
            r#"
            SELECT id, active_job_id, payload, options, scheduled_at
            FROM jobs
            WHERE status = 'e'
              AND worker_id = $1
              AND id <> ALL($2)
            "#,
        )
        .bind(self.worker_id)
        .bind(active_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn earliest_scheduled_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        let earliest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT min(scheduled_at)
            FROM jobs
            WHERE status = 'p'
              AND ($1::text[] IS NULL OR queue = ANY($1))
              AND priority BETWEEN $2 AND $3
            "#,
        )
        .bind(self.filter.queue_names())
        .bind(self.filter.min_priority())
        .bind(self.filter.max_priority())
        .fetch_one(&self.pool)
        .await?;
        Ok(earliest)
    }

    async fn release(&self, ids: &[JobId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE jobs SET status = 'p', worker_id = NULL WHERE id = ANY($1) AND status = 'e'",
        )
        .bind(ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
