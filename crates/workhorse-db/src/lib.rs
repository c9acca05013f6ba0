//! Database layer for the Workhorse job worker.
//!
//! Provides pool creation, embedded migrations, the enqueue API, the
//! skip-locked reserver, and repository traits with PostgreSQL
//! implementations.

pub mod enqueue;
pub mod error;
pub mod repo;
pub mod reserver;

pub use enqueue::{Enqueuer, ScheduleAt};
pub use error::{DbError, DbResult};
pub use repo::*;
pub use reserver::{PgReserver, Reserver};

use std::str::FromStr;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    pool_options().connect(database_url).await.map_err(Into::into)
}

/// Create a pool whose connections carry a human-readable
/// `application_name`, so sessions are identifiable in `pg_stat_activity`.
pub async fn create_pool_named(database_url: &str, application_name: &str) -> DbResult<PgPool> {
    let options =
        PgConnectOptions::from_str(database_url)?.application_name(application_name);
    pool_options().connect_with(options).await.map_err(Into::into)
}

fn pool_options() -> PgPoolOptions {
    PgPoolOptions::new().max_connections(10)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Liveness probe: true when the database answers a trivial query.
///
/// Used to distinguish a lost connection (buffer the write) from a
/// statement-level failure (report it).
pub async fn connection_active(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

/// Injectable connection liveness check.
#[async_trait::async_trait]
pub trait ConnectionProbe: Send + Sync {
    async fn connection_active(&self) -> bool;
}

/// [`ConnectionProbe`] backed by the shared pool.
pub struct PgProbe {
    pool: PgPool,
}

impl PgProbe {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConnectionProbe for PgProbe {
    async fn connection_active(&self) -> bool {
        connection_active(&self.pool).await
    }
}
