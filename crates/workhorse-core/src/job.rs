//! Job statuses, options, and enqueue/reservation types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Postgres;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::id::{JobId, WorkerId};

/// Queue used when the enqueuer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Maximum accepted queue name length.
pub const MAX_QUEUE_NAME_LEN: usize = 63;

/// Highest priority value. Lower numbers run first; 1 is the most urgent.
pub const MIN_PRIORITY: i16 = 1;

/// Lowest priority value.
pub const MAX_PRIORITY: i16 = 32767;

/// Priority assigned when the enqueuer does not specify one.
pub const DEFAULT_PRIORITY: i16 = 16383;

/// Reject empty queue names and names over [`MAX_QUEUE_NAME_LEN`].
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::EmptyQueueName);
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(Error::QueueNameTooLong(name.to_string()));
    }
    Ok(())
}

/// Reject priorities outside `1..=32767`.
///
/// Takes an `i32` so that out-of-range candidates (`0`, `32768`) can be
/// rejected rather than silently wrapped.
pub fn validate_priority(priority: i32) -> Result<i16> {
    if priority < MIN_PRIORITY as i32 || priority > MAX_PRIORITY as i32 {
        return Err(Error::PriorityOutOfRange(priority));
    }
    Ok(priority as i16)
}

/// Lifecycle state of a job row.
///
/// Stored in the database as a single character. Only `pending` rows are
/// eligible for reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Discarded,
}

impl JobStatus {
    /// The single-character database encoding.
    pub fn code(self) -> &'static str {
        match self {
            JobStatus::Pending => "p",
            JobStatus::Executing => "e",
            JobStatus::Completed => "c",
            JobStatus::Failed => "f",
            JobStatus::Discarded => "d",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "p" => Some(JobStatus::Pending),
            "e" => Some(JobStatus::Executing),
            "c" => Some(JobStatus::Completed),
            "f" => Some(JobStatus::Failed),
            "d" => Some(JobStatus::Discarded),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Discarded
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

impl sqlx::Type<Postgres> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<Postgres>>::compatible(ty)
    }
}

impl sqlx::Encode<'_, Postgres> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut PgArgumentBuffer,
    ) -> std::result::Result<IsNull, BoxDynError> {
        <&str as sqlx::Encode<'_, Postgres>>::encode_by_ref(&self.code(), buf)
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let code = <&str as sqlx::Decode<'r, Postgres>>::decode(value)?;
        JobStatus::from_code(code.trim_end())
            .ok_or_else(|| format!("unknown job status code {code:?}").into())
    }
}

/// Per-job execution options carried in the `options` JSON column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Epoch seconds after which the job is discarded instead of executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_execution_before: Option<f64>,
    /// Wall-clock seconds after which a running execution is aborted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<f64>,
}

impl JobOptions {
    pub fn is_empty(&self) -> bool {
        self.start_execution_before.is_none() && self.execution_timeout.is_none()
    }

    /// True when the queue-time limit has passed at `now`.
    pub fn queue_time_expired(&self, now: DateTime<Utc>) -> bool {
        match self.start_execution_before {
            Some(deadline) => deadline <= now.timestamp_micros() as f64 / 1_000_000.0,
            None => false,
        }
    }

    /// Execution deadline as a [`Duration`], if configured.
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// A job to insert, produced by the enqueue API.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    /// `None` takes the enqueuer's default queue priority.
    pub priority: Option<i16>,
    /// `None` schedules the job for immediate execution.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Framework-level job id carried inside the payload envelope.
    pub active_job_id: Uuid,
    pub payload: serde_json::Value,
    pub options: Option<JobOptions>,
}

impl NewJob {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            priority: None,
            scheduled_at: None,
            active_job_id: Uuid::new_v4(),
            payload,
            options: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// A row claimed by the reserver, ready for execution.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReservedJob {
    pub id: JobId,
    pub active_job_id: Uuid,
    pub payload: serde_json::Value,
    pub options: Option<serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
}

impl ReservedJob {
    /// Deserialize the `options` column.
    pub fn parse_options(&self) -> std::result::Result<JobOptions, serde_json::Error> {
        match &self.options {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(JobOptions::default()),
        }
    }
}

/// A full job row, as read back for inspection and tests.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub priority: i16,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub active_job_id: Uuid,
    pub payload: serde_json::Value,
    pub options: Option<serde_json::Value>,
    pub status: JobStatus,
    pub runtime: Option<f64>,
    pub worker_id: Option<WorkerId>,
}
