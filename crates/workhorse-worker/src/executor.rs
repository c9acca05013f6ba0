//! The executor: a bounded pool of job-running tasks.
//!
//! Jobs are posted into a backlog channel shared by the pool workers. The
//! pool grows on demand up to `max_threads`, shrinks back to `min_threads`
//! when workers sit idle past the idle timeout, and never holds more work
//! than it has capacity for: a post beyond capacity releases the job back to
//! `pending` instead of queueing it invisibly.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use workhorse_config::{ShutdownWait, WorkerConfig};
use workhorse_core::hooks::HookRegistry;
use workhorse_core::job::ReservedJob;
use workhorse_core::{JobId, JobRunner};
use workhorse_db::repo::{JobRepo, JobUpdate};
use workhorse_db::ConnectionProbe;

use crate::component::{RuntimeState, StateCell};
use crate::error::{WorkerError, WorkerResult};
use crate::pending_updates::{PendingJobUpdate, PendingUpdates};

/// Pool and outcome settings, extracted from the worker configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub max_thread_idletime: Duration,
    pub delete_completed_jobs: bool,
    pub delete_discarded_jobs: bool,
    pub delete_failed_jobs: bool,
}

impl From<&WorkerConfig> for ExecutorConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            max_thread_idletime: config.max_thread_idletime,
            delete_completed_jobs: config.delete_completed_jobs,
            delete_discarded_jobs: config.delete_discarded_jobs,
            delete_failed_jobs: config.delete_failed_jobs,
        }
    }
}

/// Invoked after each completed execution; wired by the owning worker to
/// heartbeat the worker record and nudge the provider.
pub type AfterExecute = Box<dyn Fn(JobId) -> BoxFuture<'static, ()> + Send + Sync>;

enum PoolMessage {
    Job(ReservedJob),
    /// Ask one worker above `min_threads` to retire.
    Prune,
}

enum Outcome {
    Completed,
    Failed,
    Discarded,
    Panicked(Box<dyn std::any::Any + Send>),
}

/// Runs reserved jobs and persists their outcomes.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ExecutorConfig,
    repo: Arc<dyn JobRepo>,
    probe: Arc<dyn ConnectionProbe>,
    runner: Arc<dyn JobRunner>,
    hooks: Arc<HookRegistry>,
    pending_updates: Arc<PendingUpdates>,
    after_execute: OnceLock<AfterExecute>,
    tx: mpsc::Sender<PoolMessage>,
    rx: tokio::sync::Mutex<mpsc::Receiver<PoolMessage>>,
    /// Jobs posted and not yet finished (queued + running).
    busy: AtomicUsize,
    /// Live pool worker tasks.
    spawned: AtomicUsize,
    active_ids: Mutex<HashSet<JobId>>,
    state: StateCell,
    stop: CancellationToken,
    kill: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        repo: Arc<dyn JobRepo>,
        probe: Arc<dyn ConnectionProbe>,
        runner: Arc<dyn JobRunner>,
        hooks: Arc<HookRegistry>,
        pending_updates: Arc<PendingUpdates>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.max_threads * 2);
        Self {
            inner: Arc::new(Inner {
                config,
                repo,
                probe,
                runner,
                hooks,
                pending_updates,
                after_execute: OnceLock::new(),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                busy: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
                active_ids: Mutex::new(HashSet::new()),
                state: StateCell::new(),
                stop: CancellationToken::new(),
                kill: CancellationToken::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wire the post-execution callback. May only be set once, before start.
    pub fn set_after_execute(&self, callback: AfterExecute) {
        let _ = self.inner.after_execute.set(callback);
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.state.get()
    }

    /// Start the minimum pool. Idempotent.
    pub fn start(&self) {
        if !self
            .inner
            .state
            .transition(RuntimeState::Pending, RuntimeState::Started)
        {
            return;
        }
        for _ in 0..self.inner.config.min_threads {
            self.inner.spawn_pool_worker();
        }
        info!(
            min_threads = self.inner.config.min_threads,
            max_threads = self.inner.config.max_threads,
            "executor started"
        );
    }

    /// Free execution slots: capacity not consumed by queued or running jobs.
    pub fn available_slots(&self) -> usize {
        self.inner
            .config
            .max_threads
            .saturating_sub(self.inner.busy.load(Ordering::SeqCst))
    }

    /// Ids of jobs currently queued or running on this executor.
    pub fn active_ids(&self) -> Vec<JobId> {
        self.inner.lock_active().iter().copied().collect()
    }

    /// Hand a reserved job to the pool.
    ///
    /// A job that does not fit (the provider should never exceed
    /// [`Self::available_slots`]) is logged and released back to `pending`,
    /// never dropped. Errors only when the executor is not accepting work.
    pub async fn post(&self, job: ReservedJob) -> WorkerResult<()> {
        if !self.inner.state.is_started() || self.inner.stop.is_cancelled() {
            return Err(WorkerError::NotAcceptingJobs);
        }
        let id = job.id;

        let mut slots = self.inner.busy.load(Ordering::SeqCst);
        loop {
            if slots >= self.inner.config.max_threads {
                warn!(job_id = %id, "not enough execution slots; releasing job");
                self.inner
                    .persist(id, PendingJobUpdate::Update(JobUpdate::released()))
                    .await;
                return Ok(());
            }
            match self.inner.busy.compare_exchange(
                slots,
                slots + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => slots = current,
            }
        }

        self.inner.lock_active().insert(id);
        match self.inner.tx.try_send(PoolMessage::Job(job)) {
            Ok(()) => {
                self.inner.ensure_pool_worker();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.lock_active().remove(&id);
                self.inner.busy.fetch_sub(1, Ordering::SeqCst);
                warn!(job_id = %id, "executor backlog is full; releasing job");
                self.inner
                    .persist(id, PendingJobUpdate::Update(JobUpdate::released()))
                    .await;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.lock_active().remove(&id);
                self.inner.busy.fetch_sub(1, Ordering::SeqCst);
                Err(WorkerError::NotAcceptingJobs)
            }
        }
    }

    /// Retire workers above the minimum. Invoked after an empty reservation.
    pub fn prune_pool(&self) {
        let spawned = self.inner.spawned.load(Ordering::SeqCst);
        let busy = self.inner.busy.load(Ordering::SeqCst);
        let wanted = self.inner.config.min_threads.max(busy);
        for _ in wanted..spawned {
            if self.inner.tx.try_send(PoolMessage::Prune).is_err() {
                break;
            }
        }
    }

    /// Cooperative stop: finish queued and running jobs, then retire. When a
    /// bounded wait elapses (or the wait is zero) the pool is killed.
    pub async fn stop(&self, wait: ShutdownWait) {
        if !self.inner.state.is_started() {
            return;
        }
        self.inner.stop.cancel();
        match wait {
            ShutdownWait::Indefinitely => {
                self.wait_until_idle(None).await;
            }
            ShutdownWait::For(timeout) if timeout.is_zero() => {
                self.kill();
                return;
            }
            ShutdownWait::For(timeout) => {
                if !self.wait_until_idle(Some(timeout)).await {
                    warn!("executor did not drain in time; killing pool");
                    self.kill();
                    return;
                }
            }
        }
        self.inner
            .state
            .transition(RuntimeState::Started, RuntimeState::Stopped);
        info!("executor stopped");
    }

    /// Terminate pool workers without waiting. Does not run shutdown hooks.
    pub fn kill(&self) {
        self.inner.kill.cancel();
        for handle in self.inner.lock_handles().drain(..) {
            handle.abort();
        }
        self.inner.state.set(RuntimeState::Killed);
        info!("executor killed");
    }

    /// True when no job is queued or running.
    pub fn is_idle(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst) == 0
    }

    async fn wait_until_idle(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        while !self.is_idle() {
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return false;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

/// Decrements the live-worker count even when a job panic unwinds the task.
struct PoolWorkerGuard(Arc<Inner>);

impl Drop for PoolWorkerGuard {
    fn drop(&mut self) {
        self.0.spawned.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Clears per-job tracking when an execution ends, however it ends.
struct JobGuard {
    inner: Arc<Inner>,
    id: JobId,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.inner.lock_active().remove(&self.id);
        self.inner.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Inner {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        match self.active_ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Spawn another pool worker when jobs outnumber live workers.
    fn ensure_pool_worker(self: &Arc<Self>) {
        let spawned = self.spawned.load(Ordering::SeqCst);
        if spawned < self.config.max_threads && self.busy.load(Ordering::SeqCst) > spawned {
            self.spawn_pool_worker();
        }
    }

    fn spawn_pool_worker(self: &Arc<Self>) {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = PoolWorkerGuard(Arc::clone(&inner));
            loop {
                match inner.next_message().await {
                    Some(PoolMessage::Job(job)) => inner.execute(job).await,
                    Some(PoolMessage::Prune) => {
                        if inner.spawned.load(Ordering::SeqCst) > inner.config.min_threads {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
        self.lock_handles().push(handle);
    }

    /// Wait for work. Returns `None` when this worker should retire: the
    /// executor stopped and the backlog is drained, it was killed, or the
    /// worker sat idle past the idle timeout while above the minimum.
    async fn next_message(&self) -> Option<PoolMessage> {
        let mut rx = self.rx.lock().await;
        loop {
            if self.kill.is_cancelled() {
                return None;
            }
            if self.stop.is_cancelled() {
                return rx.try_recv().ok();
            }
            tokio::select! {
                _ = self.kill.cancelled() => return None,
                _ = self.stop.cancelled() => return rx.try_recv().ok(),
                received = tokio::time::timeout(self.config.max_thread_idletime, rx.recv()) => {
                    match received {
                        Ok(message) => return message,
                        Err(_) => {
                            if self.spawned.load(Ordering::SeqCst) > self.config.min_threads {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn execute(self: &Arc<Self>, job: ReservedJob) {
        let id = job.id;
        let guard = JobGuard {
            inner: Arc::clone(self),
            id,
        };
        if !self.probe.connection_active().await {
            debug!(job_id = %id, "database connection inactive before execution");
        }

        self.hooks.run_before_job_execution(&job).await;

        let outcome: Mutex<Option<Outcome>> = Mutex::new(None);
        self.hooks
            .run_around_job_execution(
                &job,
                Box::pin(async {
                    let result = self.run_payload(&job).await;
                    match outcome.lock() {
                        Ok(mut slot) => *slot = Some(result),
                        Err(poisoned) => *poisoned.into_inner() = Some(result),
                    }
                }),
            )
            .await;
        let outcome = match outcome.into_inner() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(Outcome::Panicked(payload)) = outcome {
            drop(guard);
            std::panic::resume_unwind(payload);
        }

        self.hooks.run_after_job_execution(&job).await;
        drop(guard);
        if let Some(callback) = self.after_execute.get() {
            callback(id).await;
        }
    }

    async fn run_payload(&self, job: &ReservedJob) -> Outcome {
        let id = job.id;
        let options = match job.parse_options() {
            Ok(options) => options,
            Err(error) => {
                error!(job_id = %id, error = %error, "job options are malformed");
                self.persist_failed(
                    id,
                    0.0,
                    serde_json::json!({
                        "kind": "error",
                        "message": format!("malformed job options: {error}"),
                    }),
                )
                .await;
                return Outcome::Failed;
            }
        };

        if options.queue_time_expired(Utc::now()) {
            info!(job_id = %id, "maximum queue time expired; discarding job");
            self.persist_discarded(
                id,
                None,
                serde_json::json!({
                    "kind": "queue_time_expired",
                    "message": "Maximum queue time expired",
                }),
            )
            .await;
            return Outcome::Discarded;
        }

        let started = Instant::now();
        let run = std::panic::AssertUnwindSafe(self.runner.run(job)).catch_unwind();
        let result = match options.execution_timeout() {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    let runtime = started.elapsed().as_secs_f64();
                    warn!(job_id = %id, runtime, "execution timed out; discarding job");
                    self.persist_discarded(
                        id,
                        Some(runtime),
                        serde_json::json!({
                            "kind": "timeout",
                            "message": format!(
                                "execution timed out after {:.3}s",
                                limit.as_secs_f64()
                            ),
                        }),
                    )
                    .await;
                    return Outcome::Discarded;
                }
            },
            None => run.await,
        };

        let runtime = started.elapsed().as_secs_f64();
        match result {
            Ok(Ok(())) => {
                debug!(job_id = %id, runtime, "job completed");
                if self.config.delete_completed_jobs {
                    self.persist(id, PendingJobUpdate::Destroy).await;
                } else {
                    self.persist(id, PendingJobUpdate::Update(JobUpdate::completed(runtime)))
                        .await;
                }
                Outcome::Completed
            }
            Ok(Err(error)) => {
                self.hooks.run_on_job_failure(job, &error).await;
                error!(job_id = %id, runtime, error = %error, "job failed");
                self.persist_failed(
                    id,
                    runtime,
                    serde_json::json!({"kind": "error", "message": format!("{error:#}")}),
                )
                .await;
                Outcome::Failed
            }
            Err(payload) => {
                error!(job_id = %id, "job panicked; releasing it back to pending");
                self.persist(id, PendingJobUpdate::Update(JobUpdate::released()))
                    .await;
                Outcome::Panicked(payload)
            }
        }
    }

    async fn persist_failed(&self, id: JobId, runtime: f64, error: serde_json::Value) {
        if self.config.delete_failed_jobs {
            self.persist(id, PendingJobUpdate::Destroy).await;
        } else {
            self.persist(id, PendingJobUpdate::Update(JobUpdate::failed(runtime, error)))
                .await;
        }
    }

    async fn persist_discarded(&self, id: JobId, runtime: Option<f64>, error: serde_json::Value) {
        if self.config.delete_discarded_jobs {
            self.persist(id, PendingJobUpdate::Destroy).await;
        } else {
            self.persist(
                id,
                PendingJobUpdate::Update(JobUpdate::discarded(runtime, error)),
            )
            .await;
        }
    }

    /// Write an outcome, or buffer it when the connection is confirmed down.
    async fn persist(&self, id: JobId, update: PendingJobUpdate) {
        let result = match &update {
            PendingJobUpdate::Destroy => self.repo.destroy(id).await,
            PendingJobUpdate::Update(update) => self.repo.apply_update(id, update).await,
        };
        if let Err(error) = result {
            if !self.probe.connection_active().await {
                warn!(job_id = %id, "database connection lost; buffering job update");
                self.pending_updates.push(id, update);
            } else {
                error!(job_id = %id, error = %error, "failed to persist job outcome");
            }
        }
    }
}
