//! Operator-driven purging of stale workers and old jobs.

use std::time::Duration;

use sqlx::PgPool;
use tracing::info;

use workhorse_core::job::JobStatus;

use crate::error::DbResult;

/// Maintenance operations, safe to run while workers are live.
pub struct Cleaner {
    pool: PgPool,
}

impl Cleaner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete workers whose heartbeat is older than `older_than`.
    ///
    /// The worker-delete trigger returns their `executing` jobs to `pending`,
    /// so purging a crashed worker is what reschedules its abandoned claims.
    pub async fn purge_stale_workers(&self, older_than: Duration) -> DbResult<u64> {
        let purged = sqlx::query(
            "DELETE FROM workers WHERE last_heartbeat_at < now() - $1 * interval '1 second'",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            info!(count = purged, "purged stale workers");
        }
        Ok(purged)
    }

    /// Delete jobs enqueued more than `older_than` ago, optionally
    /// restricted to the given statuses.
    pub async fn purge_jobs(
        &self,
        older_than: Duration,
        statuses: Option<&[JobStatus]>,
    ) -> DbResult<u64> {
        let codes: Option<Vec<String>> = statuses
            .map(|statuses| statuses.iter().map(|status| status.code().to_string()).collect());
        let purged = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE enqueued_at < now() - $1 * interval '1 second'
              AND ($2::text[] IS NULL OR status = ANY($2))
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(codes)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            info!(count = purged, "purged old jobs");
        }
        Ok(purged)
    }
}
