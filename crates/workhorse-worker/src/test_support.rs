//! In-memory fakes for exercising the runtime without a database.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use workhorse_core::job::{JobRecord, JobStatus, ReservedJob};
use workhorse_core::worker_record::{WorkerRecord, WorkerStatus};
use workhorse_core::{JobId, JobRunner, WorkerId};
use workhorse_db::repo::{JobRepo, JobUpdate, WorkerRepo};
use workhorse_db::{ConnectionProbe, DbError, DbResult, Reserver};

pub fn sample_job() -> ReservedJob {
    ReservedJob {
        id: JobId::new(),
        active_job_id: uuid::Uuid::new_v4(),
        payload: serde_json::json!({"job_class": "Sample"}),
        options: None,
        scheduled_at: Utc::now(),
    }
}

pub fn job_with_options(options: serde_json::Value) -> ReservedJob {
    ReservedJob {
        options: Some(options),
        ..sample_job()
    }
}

/// Poll `predicate` until it holds, panicking after a generous deadline.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    let started = Instant::now();
    while !predicate() {
        if started.elapsed() > Duration::from_secs(5) {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct FakeProbe {
    active: AtomicBool,
}

impl FakeProbe {
    pub fn up() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionProbe for FakeProbe {
    async fn connection_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeJobRepo {
    updates: Mutex<Vec<(JobId, JobUpdate)>>,
    destroyed: Mutex<Vec<JobId>>,
    released: Mutex<Vec<JobId>>,
    fail_next_writes: AtomicUsize,
}

impl FakeJobRepo {
    /// Make the next `count` write operations fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(JobId, JobUpdate)> {
        lock(&self.updates).clone()
    }

    pub fn destroyed(&self) -> Vec<JobId> {
        lock(&self.destroyed).clone()
    }

    pub fn released(&self) -> Vec<JobId> {
        lock(&self.released).clone()
    }

    pub fn completed_count(&self) -> usize {
        self.count_status(JobStatus::Completed)
    }

    pub fn count_status(&self, status: JobStatus) -> usize {
        lock(&self.updates)
            .iter()
            .filter(|(_, update)| update.status == Some(status))
            .count()
    }

    fn check_failure(&self) -> DbResult<()> {
        let remaining = self.fail_next_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(DbError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepo for FakeJobRepo {
    async fn apply_update(&self, id: JobId, update: &JobUpdate) -> DbResult<()> {
        self.check_failure()?;
        if update.status == Some(JobStatus::Pending) {
            lock(&self.released).push(id);
        }
        lock(&self.updates).push((id, update.clone()));
        Ok(())
    }

    async fn destroy(&self, id: JobId) -> DbResult<()> {
        self.check_failure()?;
        lock(&self.destroyed).push(id);
        Ok(())
    }

    async fn release(&self, id: JobId) -> DbResult<()> {
        self.check_failure()?;
        lock(&self.released).push(id);
        Ok(())
    }

    async fn find(&self, _id: JobId) -> DbResult<Option<JobRecord>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct FakeReserver {
    batches: Mutex<VecDeque<Vec<ReservedJob>>>,
    abandoned: Mutex<Vec<ReservedJob>>,
    earliest: Mutex<Option<DateTime<Utc>>>,
    released: Mutex<Vec<Vec<JobId>>>,
}

impl FakeReserver {
    pub fn push_batch(&self, batch: Vec<ReservedJob>) {
        lock(&self.batches).push_back(batch);
    }

    pub fn set_abandoned(&self, jobs: Vec<ReservedJob>) {
        *lock(&self.abandoned) = jobs;
    }

    pub fn set_earliest(&self, at: Option<DateTime<Utc>>) {
        *lock(&self.earliest) = at;
    }

    pub fn released(&self) -> Vec<Vec<JobId>> {
        lock(&self.released).clone()
    }
}

#[async_trait]
impl Reserver for FakeReserver {
    async fn reserve(&self, limit: usize) -> DbResult<Vec<ReservedJob>> {
        let mut batch = lock(&self.batches).pop_front().unwrap_or_default();
        batch.truncate(limit);
        Ok(batch)
    }

    async fn abandoned(&self, active_ids: &[JobId]) -> DbResult<Vec<ReservedJob>> {
        let jobs = std::mem::take(&mut *lock(&self.abandoned));
        Ok(jobs
            .into_iter()
            .filter(|job| !active_ids.contains(&job.id))
            .collect())
    }

    async fn earliest_scheduled_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        Ok(*lock(&self.earliest))
    }

    async fn release(&self, ids: &[JobId]) -> DbResult<u64> {
        lock(&self.released).push(ids.to_vec());
        Ok(ids.len() as u64)
    }
}

#[derive(Default)]
pub struct FakeWorkerRepo {
    pub statuses: Mutex<Vec<WorkerStatus>>,
    pub heartbeats: AtomicUsize,
    pub registered: AtomicBool,
    pub unregistered: AtomicBool,
}

impl FakeWorkerRepo {
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        lock(&self.statuses).clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerRepo for FakeWorkerRepo {
    async fn register(&self, id: WorkerId, info: &serde_json::Value) -> DbResult<WorkerRecord> {
        self.registered.store(true, Ordering::SeqCst);
        Ok(WorkerRecord {
            id,
            hostname: "test".to_string(),
            pid: 1,
            info: info.clone(),
            started_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
            status: WorkerStatus::Initializing,
        })
    }

    async fn update_status(&self, _id: WorkerId, status: WorkerStatus) -> DbResult<()> {
        lock(&self.statuses).push(status);
        Ok(())
    }

    async fn heartbeat(&self, _id: WorkerId) -> DbResult<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unregister(&self, _id: WorkerId) -> DbResult<bool> {
        self.unregistered.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn find(&self, _id: WorkerId) -> DbResult<Option<WorkerRecord>> {
        Ok(None)
    }
}

pub struct NoopRunner;

#[async_trait]
impl JobRunner for NoopRunner {
    async fn run(&self, _job: &ReservedJob) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct FailingRunner;

#[async_trait]
impl JobRunner for FailingRunner {
    async fn run(&self, _job: &ReservedJob) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("payload exploded"))
    }
}

pub struct PanickingRunner;

#[async_trait]
impl JobRunner for PanickingRunner {
    async fn run(&self, _job: &ReservedJob) -> anyhow::Result<()> {
        panic!("payload panicked");
    }
}

pub struct SleepingRunner(pub Duration);

#[async_trait]
impl JobRunner for SleepingRunner {
    async fn run(&self, _job: &ReservedJob) -> anyhow::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Blocks every job until the token is cancelled.
pub struct BlockingRunner(pub CancellationToken);

#[async_trait]
impl JobRunner for BlockingRunner {
    async fn run(&self, _job: &ReservedJob) -> anyhow::Result<()> {
        self.0.cancelled().await;
        Ok(())
    }
}
