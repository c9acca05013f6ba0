//! The worker shell: owns the subcomponents and the worker record.
//!
//! The worker owns the executor, provider, and (optionally) the listener;
//! the subcomponents never own each other. Cross-component reactions are
//! wired here as injected callbacks: after each execution the worker record
//! heartbeats and the provider is nudged, and on an empty queue the record
//! heartbeats and idle pool workers are pruned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tracing::{info, warn};

use workhorse_config::WorkerConfig;
use workhorse_core::hooks::HookRegistry;
use workhorse_core::worker_record::WorkerStatus;
use workhorse_core::{JobRunner, WorkerId};
use workhorse_db::repo::{JobRepo, PgJobRepo, PgWorkerRepo, WorkerRepo};
use workhorse_db::{ConnectionProbe, PgProbe, PgReserver, Reserver};

use crate::component::{RuntimeState, StateCell};
use crate::error::WorkerResult;
use crate::executor::{Executor, ExecutorConfig};
use crate::listener::Listener;
use crate::pending_updates::PendingUpdates;
use crate::provider::Provider;

/// Heartbeats are coarsened to at most one write per this interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// A single worker process: worker row, executor pool, provider, listener.
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    pool: Option<PgPool>,
    records: Arc<dyn WorkerRepo>,
    hooks: Arc<HookRegistry>,
    executor: Executor,
    provider: Arc<Provider>,
    listener: Option<Listener>,
    state: StateCell,
    stopping: AtomicBool,
}

impl Worker {
    /// Connect a pool for `database_url` (named after this crate when
    /// `set_db_connection_name` is on) and build a worker on it.
    pub async fn connect(
        database_url: &str,
        config: WorkerConfig,
        runner: Arc<dyn JobRunner>,
        hooks: Arc<HookRegistry>,
    ) -> WorkerResult<Self> {
        let pool = if config.set_db_connection_name {
            workhorse_db::create_pool_named(database_url, "workhorse").await?
        } else {
            workhorse_db::create_pool(database_url).await?
        };
        Ok(Self::new(pool, config, runner, hooks))
    }

    /// Build a worker and wire its subcomponents against PostgreSQL.
    pub fn new(
        pool: PgPool,
        config: WorkerConfig,
        runner: Arc<dyn JobRunner>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let id = WorkerId::new();
        let filter = config.job_filter();
        let reserver: Arc<dyn Reserver> = Arc::new(PgReserver::new(pool.clone(), id, filter));
        let repo: Arc<dyn JobRepo> = Arc::new(PgJobRepo::new(pool.clone()));
        let records: Arc<dyn WorkerRepo> = Arc::new(PgWorkerRepo::new(pool.clone()));
        let probe: Arc<dyn ConnectionProbe> = Arc::new(PgProbe::new(pool.clone()));
        Self::assemble(
            Some(pool),
            id,
            config,
            reserver,
            repo,
            records,
            probe,
            runner,
            hooks,
        )
    }

    /// Assembly seam shared by `new` and the in-memory tests. Without a pool
    /// no listener is created (notification wait needs a real connection).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        pool: Option<PgPool>,
        id: WorkerId,
        config: WorkerConfig,
        reserver: Arc<dyn Reserver>,
        repo: Arc<dyn JobRepo>,
        records: Arc<dyn WorkerRepo>,
        probe: Arc<dyn ConnectionProbe>,
        runner: Arc<dyn JobRunner>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let heartbeat = Arc::new(Heartbeat::new(
            Arc::clone(&records),
            id,
            HEARTBEAT_INTERVAL,
        ));
        let pending_updates = Arc::new(PendingUpdates::new());
        let executor = Executor::new(
            ExecutorConfig::from(&config),
            Arc::clone(&repo),
            Arc::clone(&probe),
            runner,
            Arc::clone(&hooks),
            Arc::clone(&pending_updates),
        );
        let provider = Arc::new(Provider::new(
            reserver,
            executor.clone(),
            repo,
            probe,
            pending_updates,
            Arc::clone(&hooks),
            config.polling_interval,
            config.polling_jitter,
        ));

        // After each execution: heartbeat, then nudge the provider. The
        // callback holds the provider weakly so ownership stays one-way.
        {
            let heartbeat = Arc::clone(&heartbeat);
            let provider = Arc::downgrade(&provider);
            executor.set_after_execute(Box::new(move |_job_id| {
                let heartbeat = Arc::clone(&heartbeat);
                let provider = provider.clone();
                Box::pin(async move {
                    heartbeat.beat().await;
                    if let Some(provider) = provider.upgrade() {
                        let _ = provider.poll();
                    }
                })
            }));
        }

        // On an empty queue: heartbeat, then prune idle pool workers.
        {
            let heartbeat = Arc::clone(&heartbeat);
            let executor = executor.clone();
            provider.set_queue_empty(Box::new(move || {
                let heartbeat = Arc::clone(&heartbeat);
                let executor = executor.clone();
                Box::pin(async move {
                    heartbeat.beat().await;
                    executor.prune_pool();
                })
            }));
        }

        let listener = match (&pool, config.enable_listener) {
            (Some(pool), true) => Some(Listener::new(
                pool.clone(),
                id,
                config.job_filter(),
                Arc::clone(&provider),
                Arc::clone(&hooks),
            )),
            _ => None,
        };

        Self {
            id,
            config,
            pool,
            records,
            hooks,
            executor,
            provider,
            listener,
            state: StateCell::new(),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// State for the embeddable healthcheck endpoints
    /// ([`crate::healthcheck::serve`]), using the configured
    /// `healthcheck_timeout` as the heartbeat staleness bound. `None` when
    /// the worker was assembled without a pool.
    pub fn healthcheck_state(&self) -> Option<crate::healthcheck::HealthState> {
        self.pool.clone().map(|pool| {
            crate::healthcheck::HealthState::new(
                pool,
                Arc::clone(&self.records),
                self.id,
                self.config.healthcheck_timeout,
            )
        })
    }

    pub fn state(&self) -> RuntimeState {
        self.state.get()
    }

    /// Create the worker record and start subcomponents leaf-first
    /// (executor, listener, then the provider, so its first reservation sees
    /// fully started collaborators). Idempotent.
    pub async fn start(&self) -> WorkerResult<()> {
        if !self
            .state
            .transition(RuntimeState::Pending, RuntimeState::Started)
        {
            return Ok(());
        }
        if let Err(error) = self.try_start().await {
            self.state.set(RuntimeState::Crashed);
            return Err(error);
        }
        Ok(())
    }

    async fn try_start(&self) -> WorkerResult<()> {
        self.hooks.run_before_startup().await;
        self.records.register(self.id, &self.info()).await?;

        self.executor.start();
        if let Some(listener) = &self.listener {
            listener.start();
        }
        self.provider.start();

        self.records
            .update_status(self.id, WorkerStatus::Running)
            .await?;
        info!(worker_id = %self.id, "worker started");
        self.hooks.run_after_startup().await;
        Ok(())
    }

    /// Clean stop: subcomponents root-first (provider, listener, executor),
    /// bounded by `wait_for_termination`, then delete the worker record,
    /// which releases any jobs still claimed.
    pub async fn stop(&self) {
        if !self.state.is_started() {
            return;
        }
        if self.stopping.swap(true, Ordering::SeqCst) {
            self.join().await;
            return;
        }

        self.hooks.run_before_shutdown().await;
        if let Err(error) = self
            .records
            .update_status(self.id, WorkerStatus::ShuttingDown)
            .await
        {
            warn!(error = %error, "could not mark worker as shutting down");
        }

        self.provider.stop().await;
        if let Some(listener) = &self.listener {
            listener.stop().await;
        }
        self.executor.stop(self.config.wait_for_termination).await;

        if let Err(error) = self.records.unregister(self.id).await {
            warn!(error = %error, "could not delete worker record");
        }
        self.state.set(RuntimeState::Stopped);
        info!(worker_id = %self.id, "worker stopped");
        self.hooks.run_after_shutdown().await;
    }

    /// Terminate without waiting for in-flight jobs and without running
    /// shutdown hooks. The record is still deleted so the delete trigger
    /// releases this worker's claims.
    pub async fn kill(&self) {
        if self.state.get().is_terminal() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.provider.stop().await;
        if let Some(listener) = &self.listener {
            listener.stop().await;
        }
        self.executor.kill();
        if let Err(error) = self.records.unregister(self.id).await {
            warn!(error = %error, "could not delete worker record");
        }
        self.state.set(RuntimeState::Killed);
        info!(worker_id = %self.id, "worker killed");
    }

    /// Block until the worker reaches a terminal state.
    pub async fn join(&self) {
        self.state.join().await;
    }

    fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "queues": self.config.queues,
            "min_priority": self.config.min_priority,
            "max_priority": self.config.max_priority,
            "min_threads": self.config.min_threads,
            "max_threads": self.config.max_threads,
            "polling_interval_secs": self.config.polling_interval.as_secs_f64(),
            "listener": self.config.enable_listener,
        })
    }
}

/// Worker-record heartbeat, coarsened to once per interval. The repository
/// write is monotonic, so coarsening only reduces write volume.
pub(crate) struct Heartbeat {
    records: Arc<dyn WorkerRepo>,
    worker_id: WorkerId,
    interval: Duration,
    last: std::sync::Mutex<Option<Instant>>,
}

impl Heartbeat {
    pub fn new(records: Arc<dyn WorkerRepo>, worker_id: WorkerId, interval: Duration) -> Self {
        Self {
            records,
            worker_id,
            interval,
            last: std::sync::Mutex::new(None),
        }
    }

    pub async fn beat(&self) {
        {
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(at) = *last {
                if at.elapsed() < self.interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        if let Err(error) = self.records.heartbeat(self.worker_id).await {
            warn!(error = %error, "worker heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use workhorse_core::job::JobStatus;

    fn test_worker(
        config: WorkerConfig,
        reserver: Arc<FakeReserver>,
        repo: Arc<FakeJobRepo>,
        records: Arc<FakeWorkerRepo>,
        runner: Arc<dyn JobRunner>,
        hooks: Arc<HookRegistry>,
    ) -> Worker {
        Worker::assemble(
            None,
            WorkerId::new(),
            config,
            reserver,
            repo,
            records,
            Arc::new(FakeProbe::up()),
            runner,
            hooks,
        )
    }

    #[tokio::test]
    async fn lifecycle_registers_runs_and_unregisters() {
        let reserver = Arc::new(FakeReserver::default());
        reserver.push_batch(vec![sample_job()]);
        let repo = Arc::new(FakeJobRepo::default());
        let records = Arc::new(FakeWorkerRepo::default());
        let worker = test_worker(
            WorkerConfig::default(),
            reserver,
            repo.clone(),
            records.clone(),
            Arc::new(NoopRunner),
            Arc::new(HookRegistry::new()),
        );

        worker.start().await.expect("start");
        assert!(records.registered.load(Ordering::SeqCst));
        assert_eq!(records.statuses(), vec![WorkerStatus::Running]);

        wait_until(|| repo.completed_count() == 1).await;
        // The after-execute callback heartbeats the record.
        wait_until(|| records.heartbeat_count() >= 1).await;

        worker.stop().await;
        assert!(records.unregistered.load(Ordering::SeqCst));
        assert_eq!(worker.state(), RuntimeState::Stopped);
        assert_eq!(
            records.statuses(),
            vec![WorkerStatus::Running, WorkerStatus::ShuttingDown]
        );
        worker.join().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let records = Arc::new(FakeWorkerRepo::default());
        let worker = test_worker(
            WorkerConfig::default(),
            Arc::new(FakeReserver::default()),
            Arc::new(FakeJobRepo::default()),
            records.clone(),
            Arc::new(NoopRunner),
            Arc::new(HookRegistry::new()),
        );
        worker.start().await.expect("start");
        worker.start().await.expect("second start");
        assert_eq!(records.statuses(), vec![WorkerStatus::Running]);
        worker.stop().await;
    }

    #[tokio::test]
    async fn startup_and_shutdown_hooks_run_in_order() {
        let order: Arc<std::sync::Mutex<Vec<&'static str>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::new();
        for (point, register) in [
            ("before_startup", 0),
            ("after_startup", 1),
            ("before_shutdown", 2),
            ("after_shutdown", 3),
        ] {
            let order = Arc::clone(&order);
            let handler: workhorse_core::hooks::LifecycleHandler = Box::new(move || {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push(point);
                    Ok(())
                })
            });
            match register {
                0 => hooks.before_startup(handler),
                1 => hooks.after_startup(handler),
                2 => hooks.before_shutdown(handler),
                _ => hooks.after_shutdown(handler),
            };
        }

        let worker = test_worker(
            WorkerConfig::default(),
            Arc::new(FakeReserver::default()),
            Arc::new(FakeJobRepo::default()),
            Arc::new(FakeWorkerRepo::default()),
            Arc::new(NoopRunner),
            Arc::new(hooks),
        );
        worker.start().await.expect("start");
        worker.stop().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "before_startup",
                "after_startup",
                "before_shutdown",
                "after_shutdown"
            ]
        );
    }

    #[tokio::test]
    async fn kill_does_not_run_shutdown_hooks() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut hooks = HookRegistry::new();
        {
            let ran = Arc::clone(&ran);
            hooks.before_shutdown(Box::new(move || {
                let ran = Arc::clone(&ran);
                Box::pin(async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }
        let records = Arc::new(FakeWorkerRepo::default());
        let worker = test_worker(
            WorkerConfig::default(),
            Arc::new(FakeReserver::default()),
            Arc::new(FakeJobRepo::default()),
            records.clone(),
            Arc::new(NoopRunner),
            Arc::new(hooks),
        );
        worker.start().await.expect("start");
        worker.kill().await;

        assert!(!ran.load(Ordering::SeqCst));
        assert!(records.unregistered.load(Ordering::SeqCst));
        assert_eq!(worker.state(), RuntimeState::Killed);
    }

    #[tokio::test]
    async fn bounded_shutdown_kills_a_blocked_pool() {
        let gate = tokio_util::sync::CancellationToken::new();
        let reserver = Arc::new(FakeReserver::default());
        reserver.push_batch(vec![sample_job()]);
        let repo = Arc::new(FakeJobRepo::default());
        let config = WorkerConfig::builder()
            .threads(1, 1)
            .wait_for_termination(workhorse_config::ShutdownWait::For(Duration::from_millis(
                100,
            )))
            .build()
            .expect("config");
        let worker = test_worker(
            config,
            reserver,
            repo.clone(),
            Arc::new(FakeWorkerRepo::default()),
            Arc::new(BlockingRunner(gate.clone())),
            Arc::new(HookRegistry::new()),
        );

        worker.start().await.expect("start");
        // Give the pool a moment to pick the job up, then stop with a short
        // bound; the blocked job forces the kill path.
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;
        assert_eq!(worker.state(), RuntimeState::Stopped);
        // The blocked job never completed.
        assert_eq!(repo.count_status(JobStatus::Completed), 0);
        gate.cancel();
    }

    #[tokio::test]
    async fn heartbeats_are_coarsened() {
        let records = Arc::new(FakeWorkerRepo::default());
        let heartbeat = Heartbeat::new(
            records.clone() as Arc<dyn WorkerRepo>,
            WorkerId::new(),
            Duration::from_secs(60),
        );
        heartbeat.beat().await;
        heartbeat.beat().await;
        heartbeat.beat().await;
        assert_eq!(records.heartbeat_count(), 1);

        let eager = Heartbeat::new(
            records.clone() as Arc<dyn WorkerRepo>,
            WorkerId::new(),
            Duration::ZERO,
        );
        eager.beat().await;
        eager.beat().await;
        assert_eq!(records.heartbeat_count(), 3);
    }
}
