//! Worker row lifecycle.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use workhorse_core::WorkerId;
use workhorse_core::worker_record::{WorkerRecord, WorkerStatus};

use crate::error::{DbError, DbResult};

/// Persistence of worker rows: registration, status, heartbeat, removal.
#[async_trait]
pub trait WorkerRepo: Send + Sync {
    /// Insert the worker row in `initializing` state. `(hostname, pid)` is
    /// unique, so a stale row from a previous run of the same process slot
    /// must have been purged first.
    async fn register(&self, id: WorkerId, info: &serde_json::Value) -> DbResult<WorkerRecord>;

    async fn update_status(&self, id: WorkerId, status: WorkerStatus) -> DbResult<()>;

    /// Advance `last_heartbeat_at`. Monotonic: an out-of-order write can
    /// never move the timestamp backwards.
    async fn heartbeat(&self, id: WorkerId) -> DbResult<()>;

    /// Delete the worker row. The delete trigger releases any `executing`
    /// jobs the worker still owned. Returns false when the row was already
    /// gone.
    async fn unregister(&self, id: WorkerId) -> DbResult<bool>;

    async fn find(&self, id: WorkerId) -> DbResult<Option<WorkerRecord>>;
}

/// PostgreSQL implementation of [`WorkerRepo`].
pub struct PgWorkerRepo {
    pool: PgPool,
}

impl PgWorkerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn hostname() -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }
}

#[async_trait]
impl WorkerRepo for PgWorkerRepo {
    async fn register(&self, id: WorkerId, info: &serde_json::Value) -> DbResult<WorkerRecord> {
        let hostname = Self::hostname();
        let pid = std::process::id() as i32;
        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            INSERT INTO workers (id, hostname, pid, info)
            VALUES ($1, $2, $3, $4)
            RETURNING id, hostname, pid, info, started_at, last_heartbeat_at, status
            "#,
        )
        .bind(id)
        .bind(&hostname)
        .bind(pid)
        .bind(info)
        .fetch_one(&self.pool)
        .await?;

        info!(worker_id = %id, hostname = %hostname, pid, "registered worker");
        Ok(record)
    }

    async fn update_status(&self, id: WorkerId, status: WorkerStatus) -> DbResult<()> {
        let updated = sqlx::query("UPDATE workers SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("worker {id}")));
        }
        Ok(())
    }

    async fn heartbeat(&self, id: WorkerId) -> DbResult<()> {
        sqlx::query(
            "UPDATE workers SET last_heartbeat_at = GREATEST(last_heartbeat_at, now()) WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unregister(&self, id: WorkerId) -> DbResult<bool> {
        let deleted = sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn find(&self, id: WorkerId) -> DbResult<Option<WorkerRecord>> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            SELECT id, hostname, pid, info, started_at, last_heartbeat_at, status
            FROM workers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
