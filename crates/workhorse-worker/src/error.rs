//! Worker runtime error types.

use thiserror::Error;

use workhorse_db::DbError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("component is not running")]
    NotRunning,

    #[error("executor is not accepting jobs")]
    NotAcceptingJobs,

    #[error("database connection is not available")]
    ConnectionLost,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
