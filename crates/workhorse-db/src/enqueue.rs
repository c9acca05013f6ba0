//! The enqueue API.
//!
//! Inserts job rows with prepared parameters; the enqueue-broadcast trigger
//! turns each insert into a `jobs_enqueued` notification.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::debug;

use workhorse_core::hooks::HookRegistry;
use workhorse_core::job::{NewJob, validate_priority, validate_queue_name};
use workhorse_core::JobId;

use crate::error::{DbError, DbResult};

/// When a job should first become eligible for execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleAt {
    At(DateTime<Utc>),
    /// A calendar date, scheduled for midnight UTC.
    On(NaiveDate),
    /// Positive epoch seconds.
    Epoch(f64),
}

impl ScheduleAt {
    fn resolve(self) -> DbResult<DateTime<Utc>> {
        match self {
            ScheduleAt::At(at) => Ok(at),
            ScheduleAt::On(date) => Ok(date
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .unwrap_or_else(Utc::now)),
            ScheduleAt::Epoch(epoch) => {
                if !epoch.is_finite() || epoch <= 0.0 {
                    return Err(DbError::InvalidScheduleAt(epoch));
                }
                DateTime::from_timestamp_micros((epoch * 1_000_000.0) as i64)
                    .ok_or(DbError::InvalidScheduleAt(epoch))
            }
        }
    }
}

impl From<DateTime<Utc>> for ScheduleAt {
    fn from(at: DateTime<Utc>) -> Self {
        ScheduleAt::At(at)
    }
}

impl From<NaiveDate> for ScheduleAt {
    fn from(date: NaiveDate) -> Self {
        ScheduleAt::On(date)
    }
}

impl From<f64> for ScheduleAt {
    fn from(epoch: f64) -> Self {
        ScheduleAt::Epoch(epoch)
    }
}

impl From<i64> for ScheduleAt {
    fn from(epoch: i64) -> Self {
        ScheduleAt::Epoch(epoch as f64)
    }
}

/// Inserts jobs, running the enqueue hook chain around each insert.
#[derive(Clone)]
pub struct Enqueuer {
    pool: PgPool,
    hooks: Option<Arc<HookRegistry>>,
    default_priority: i16,
}

impl Enqueuer {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            hooks: None,
            default_priority: workhorse_core::job::DEFAULT_PRIORITY,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Priority assigned to jobs that do not name one (the
    /// `default_queue_priority` setting).
    pub fn with_default_priority(mut self, priority: i16) -> Self {
        self.default_priority = priority;
        self
    }

    /// Insert a job scheduled for immediate execution (or at the job's own
    /// `scheduled_at`, when set).
    ///
    /// Rejects out-of-range priorities and invalid queue names before any
    /// statement is issued.
    pub async fn push(&self, job: NewJob) -> DbResult<JobId> {
        validate_queue_name(&job.queue)?;
        let priority = job.priority.unwrap_or(self.default_priority);
        validate_priority(priority as i32)?;

        match &self.hooks {
            None => self.insert(&job, priority).await,
            Some(hooks) => {
                hooks.run_before_enqueue(&job).await;
                let slot: Mutex<Option<DbResult<JobId>>> = Mutex::new(None);
                hooks
                    .run_around_enqueue(
                        &job,
                        Box::pin(async {
                            let inserted = self.insert(&job, priority).await;
                            match slot.lock() {
                                Ok(mut guard) => *guard = Some(inserted),
                                Err(poisoned) => *poisoned.into_inner() = Some(inserted),
                            }
                        }),
                    )
                    .await;
                let id = match slot.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()) {
                    Some(inserted) => inserted?,
                    // The chain always runs its body; insert directly if a
                    // poisoned lock lost the result.
                    None => self.insert(&job, priority).await?,
                };
                hooks.run_after_enqueue(&job).await;
                Ok(id)
            }
        }
    }

    /// Insert a job to run no earlier than `at`.
    pub async fn push_at(&self, job: NewJob, at: impl Into<ScheduleAt>) -> DbResult<JobId> {
        let at = at.into().resolve()?;
        self.push(job.scheduled_at(at)).await
    }

    async fn insert(&self, job: &NewJob, priority: i16) -> DbResult<JobId> {
        let options = match &job.options {
            Some(options) if !options.is_empty() => serde_json::to_value(options).ok(),
            _ => None,
        };
        let id: JobId = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (queue, priority, scheduled_at, active_job_id, payload, options)
            VALUES ($1, $2, COALESCE(GREATEST($3, now()), now()), $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&job.queue)
        .bind(priority)
        .bind(job.scheduled_at)
        .bind(job.active_job_id)
        .bind(&job.payload)
        .bind(options)
        .fetch_one(&self.pool)
        .await?;

        debug!(job_id = %id, queue = %job.queue, priority, "enqueued job");
        Ok(id)
    }
}
