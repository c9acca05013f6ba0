//! The provider: decides *when* to reserve and dispatch work.
//!
//! Arbitrates three wakeup sources (listener hints, the next known
//! future-scheduled job, and the polling clock) and drives the reserver
//! only when the executor has free slots. Restarts itself with exponential
//! back-off on unhandled errors; escalates a fatal error once the restart
//! budget is exhausted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use workhorse_core::JobId;
use workhorse_core::backoff::{MAX_CONSECUTIVE_ERRORS, jittered_polling_interval, restart_delay};
use workhorse_core::hooks::HookRegistry;
use workhorse_db::repo::JobRepo;
use workhorse_db::{ConnectionProbe, Reserver};

use crate::component::{RuntimeState, StateCell};
use crate::error::{WorkerError, WorkerResult};
use crate::executor::Executor;
use crate::pending_updates::{PendingJobUpdate, PendingUpdates};

/// Upper bound on one wait, regardless of poll and schedule times.
const MAX_WAIT: Duration = Duration::from_secs(300);

/// Slack added when deciding whether a poll is due.
const POLL_SLACK: Duration = Duration::from_millis(1);

/// Invoked after a reservation that returned no rows while none are
/// scheduled; wired by the owning worker to heartbeat and prune the pool.
pub type QueueEmpty = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// What the provider knows about the next scheduled job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum NextJob {
    /// The database has not been asked yet.
    Unknown,
    /// Authoritatively nothing pending.
    Nothing,
    At(DateTime<Utc>),
}

/// Drives the reserver and feeds the executor.
pub struct Provider {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    reserver: Arc<dyn Reserver>,
    executor: Executor,
    repo: Arc<dyn JobRepo>,
    probe: Arc<dyn ConnectionProbe>,
    pending_updates: Arc<PendingUpdates>,
    hooks: Arc<HookRegistry>,
    queue_empty: OnceLock<QueueEmpty>,
    event: Notify,
    next_job: Mutex<NextJob>,
    next_poll: Mutex<Option<Instant>>,
    polling_interval: Duration,
    polling_jitter: f64,
    consecutive_errors: AtomicU32,
    state: StateCell,
    stop: CancellationToken,
}

impl Provider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reserver: Arc<dyn Reserver>,
        executor: Executor,
        repo: Arc<dyn JobRepo>,
        probe: Arc<dyn ConnectionProbe>,
        pending_updates: Arc<PendingUpdates>,
        hooks: Arc<HookRegistry>,
        polling_interval: Duration,
        polling_jitter: f64,
    ) -> Self {
        Self {
            handle: Mutex::new(None),
            inner: Arc::new(Inner {
                reserver,
                executor,
                repo,
                probe,
                pending_updates,
                hooks,
                queue_empty: OnceLock::new(),
                event: Notify::new(),
                next_job: Mutex::new(NextJob::Unknown),
                // Poll immediately on startup, then on the jittered interval.
                next_poll: Mutex::new(Some(Instant::now())),
                polling_interval,
                polling_jitter,
                consecutive_errors: AtomicU32::new(0),
                state: StateCell::new(),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Wire the empty-queue callback. May only be set once, before start.
    pub fn set_queue_empty(&self, callback: QueueEmpty) {
        let _ = self.inner.queue_empty.set(callback);
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.state.get()
    }

    /// Start the provider loop. Idempotent.
    pub fn start(&self) {
        if !self
            .inner
            .state
            .transition(RuntimeState::Pending, RuntimeState::Started)
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run(inner));
        match self.handle.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        info!("provider started");
    }

    /// Cooperative stop; waits for the loop to wind down.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        self.inner.event.notify_one();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("provider stopped");
    }

    /// A non-authoritative signal that a job exists at `scheduled_at`.
    ///
    /// Adopted when earlier than what is already known. While the next-job
    /// time is still unknown, only an already-due time is adopted: a future
    /// value cannot be substantiated without asking the database.
    pub fn hint(&self, scheduled_at: DateTime<Utc>) {
        let mut next = self.inner.lock_next_job();
        let adopt = match *next {
            NextJob::Unknown => scheduled_at <= Utc::now(),
            NextJob::Nothing => true,
            NextJob::At(known) => scheduled_at < known,
        };
        if adopt {
            debug!(scheduled_at = %scheduled_at, "adopting job hint");
            *next = NextJob::At(scheduled_at);
            drop(next);
            self.inner.event.notify_one();
        }
    }

    /// Forget the cached next-job time and reserve on the next wakeup,
    /// refreshing it authoritatively from the database.
    pub fn refresh_next_job(&self) -> WorkerResult<()> {
        *self.inner.lock_next_job() = NextJob::Unknown;
        self.poll()
    }

    /// Force an immediate poll. Errors when the provider is not running.
    pub fn poll(&self) -> WorkerResult<()> {
        if !self.inner.state.is_started() {
            return Err(WorkerError::NotRunning);
        }
        *self.inner.lock_next_poll() = Some(Instant::now());
        self.inner.event.notify_one();
        Ok(())
    }

    pub async fn join(&self) {
        self.inner.state.join().await;
    }

    #[cfg(test)]
    pub(crate) fn next_job(&self) -> NextJob {
        *self.inner.lock_next_job()
    }
}

async fn run(inner: Arc<Inner>) {
    loop {
        if inner.stop.is_cancelled() {
            break;
        }
        match inner.run_once().await {
            Ok(()) => break,
            Err(error) => {
                let errors = inner.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(error = %error, consecutive_errors = errors, "provider iteration failed");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    inner.state.set(RuntimeState::Crashed);
                    inner
                        .hooks
                        .run_on_fatal_error(&anyhow::anyhow!(
                            "provider failed {errors} consecutive times, giving up: {error}"
                        ))
                        .await;
                    return;
                }
                let delay = restart_delay(errors);
                warn!(delay_secs = delay.as_secs_f64(), "provider restarting after back-off");
                tokio::select! {
                    _ = inner.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    inner
        .state
        .transition(RuntimeState::Started, RuntimeState::Stopped);
}

impl Inner {
    fn lock_next_job(&self) -> std::sync::MutexGuard<'_, NextJob> {
        match self.next_job.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_next_poll(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.next_poll.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run_once(&self) -> WorkerResult<()> {
        self.ensure_connection().await?;
        self.flush_pending_updates().await?;
        self.redispatch_abandoned().await?;

        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }
            let wait = self.wait_timeout();
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = tokio::time::timeout(wait, self.event.notified()) => {}
            }
            if self.stop.is_cancelled() {
                return Ok(());
            }
            if self.should_reserve_now() {
                self.reserve_and_dispatch().await?;
            }
            self.consecutive_errors.store(0, Ordering::SeqCst);
        }
    }

    async fn ensure_connection(&self) -> WorkerResult<()> {
        if self.probe.connection_active().await {
            Ok(())
        } else {
            Err(WorkerError::ConnectionLost)
        }
    }

    /// Replay writes buffered during a database outage.
    async fn flush_pending_updates(&self) -> WorkerResult<()> {
        let drained = self.pending_updates.drain();
        if drained.is_empty() {
            return Ok(());
        }
        info!(count = drained.len(), "flushing buffered job updates");
        let mut remaining = drained.into_iter();
        while let Some((id, update)) = remaining.next() {
            let result = match &update {
                PendingJobUpdate::Destroy => self.repo.destroy(id).await,
                PendingJobUpdate::Update(update) => self.repo.apply_update(id, update).await,
            };
            if let Err(error) = result {
                self.pending_updates.restore(id, update);
                for (id, update) in remaining.by_ref() {
                    self.pending_updates.restore(id, update);
                }
                return Err(error.into());
            }
        }
        Ok(())
    }

    /// Re-post rows this worker still owns from a previous run.
    async fn redispatch_abandoned(&self) -> WorkerResult<()> {
        let active = self.executor.active_ids();
        let abandoned = self.reserver.abandoned(&active).await?;
        for job in abandoned {
            info!(job_id = %job.id, "re-dispatching abandoned job");
            self.executor.post(job).await?;
        }
        Ok(())
    }

    fn wait_timeout(&self) -> Duration {
        let free_slots = self.executor.available_slots();
        let next_poll_in = self
            .lock_next_poll()
            .map(|at| at.saturating_duration_since(Instant::now()));
        let next_job_in = match *self.lock_next_job() {
            NextJob::At(at) => Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
            NextJob::Unknown | NextJob::Nothing => None,
        };
        compute_wait_timeout(free_slots, next_poll_in, next_job_in)
    }

    /// True when a reservation is due: the poll clock fired (advance it by a
    /// jittered interval) or a known job time has arrived.
    fn should_reserve_now(&self) -> bool {
        {
            let mut poll = self.lock_next_poll();
            if let Some(at) = *poll {
                if at <= Instant::now() + POLL_SLACK {
                    *poll = Some(
                        Instant::now()
                            + jittered_polling_interval(self.polling_interval, self.polling_jitter),
                    );
                    return true;
                }
            }
        }
        matches!(*self.lock_next_job(), NextJob::At(at) if at <= Utc::now())
    }

    async fn reserve_and_dispatch(&self) -> WorkerResult<()> {
        let free = self.executor.available_slots();
        if free == 0 {
            return Ok(());
        }

        let batch = self.reserver.reserve(free).await?;
        let claimed = batch.len();
        if claimed > 0 {
            debug!(count = claimed, "dispatching reserved jobs");
            let ids: Vec<JobId> = batch.iter().map(|job| job.id).collect();
            for job in batch {
                if let Err(error) = self.executor.post(job).await {
                    warn!(error = %error, "dispatch failed; releasing the reserved batch");
                    self.reserver.release(&ids).await?;
                    return Err(error);
                }
            }
        }

        if claimed < free {
            // The queue came up short, so the cached next-job time is stale;
            // refresh it authoritatively.
            let earliest = self.reserver.earliest_scheduled_at().await?;
            *self.lock_next_job() = match earliest {
                Some(at) => NextJob::At(at),
                None => NextJob::Nothing,
            };
            if earliest.is_none() && claimed == 0 {
                if let Some(callback) = self.queue_empty.get() {
                    callback().await;
                }
            }
        } else {
            // A full batch: more work probably exists right now.
            let mut next = self.lock_next_job();
            if *next == NextJob::Unknown {
                *next = NextJob::At(Utc::now());
            }
        }
        Ok(())
    }
}

/// Pure wait computation: bounded by [`MAX_WAIT`], shortened to the next
/// poll or next known job, and pinned to the maximum when no slot is free
/// (there is nothing to dispatch to).
fn compute_wait_timeout(
    free_slots: usize,
    next_poll_in: Option<Duration>,
    next_job_in: Option<Duration>,
) -> Duration {
    if free_slots == 0 {
        return MAX_WAIT;
    }
    let mut wait = MAX_WAIT;
    if let Some(until_poll) = next_poll_in {
        wait = wait.min(until_poll);
    }
    if let Some(until_job) = next_job_in {
        wait = wait.min(until_job);
    }
    wait
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::test_support::*;
    use workhorse_core::job::JobStatus;

    fn test_provider(
        reserver: Arc<FakeReserver>,
        repo: Arc<FakeJobRepo>,
        probe: Arc<FakeProbe>,
        runner: Arc<dyn workhorse_core::JobRunner>,
        max_threads: usize,
    ) -> (Provider, Executor, Arc<PendingUpdates>) {
        let hooks = Arc::new(HookRegistry::new());
        let pending = Arc::new(PendingUpdates::new());
        let executor = Executor::new(
            ExecutorConfig {
                min_threads: 1,
                max_threads,
                max_thread_idletime: Duration::from_secs(60),
                delete_completed_jobs: false,
                delete_discarded_jobs: false,
                delete_failed_jobs: false,
            },
            repo.clone(),
            probe.clone(),
            runner,
            hooks.clone(),
            pending.clone(),
        );
        executor.start();
        let provider = Provider::new(
            reserver,
            executor.clone(),
            repo,
            probe,
            pending.clone(),
            hooks,
            Duration::from_secs(60),
            0.0,
        );
        (provider, executor, pending)
    }

    #[test]
    fn wait_is_capped_and_shortened_by_poll_and_job_times() {
        assert_eq!(compute_wait_timeout(1, None, None), MAX_WAIT);
        assert_eq!(
            compute_wait_timeout(1, Some(Duration::from_secs(5)), None),
            Duration::from_secs(5)
        );
        assert_eq!(
            compute_wait_timeout(1, Some(Duration::from_secs(5)), Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            compute_wait_timeout(1, Some(Duration::from_secs(500)), None),
            MAX_WAIT
        );
    }

    #[test]
    fn no_free_slots_means_the_full_wait() {
        assert_eq!(
            compute_wait_timeout(0, Some(Duration::ZERO), Some(Duration::ZERO)),
            MAX_WAIT
        );
    }

    #[tokio::test]
    async fn hints_follow_the_adoption_rules() {
        let (provider, _executor, _pending) = test_provider(
            Arc::new(FakeReserver::default()),
            Arc::new(FakeJobRepo::default()),
            Arc::new(FakeProbe::up()),
            Arc::new(NoopRunner),
            1,
        );

        // Unknown: a future hint cannot be substantiated and is ignored.
        let future = Utc::now() + chrono::Duration::seconds(60);
        provider.hint(future);
        assert_eq!(provider.next_job(), NextJob::Unknown);

        // Unknown: an already-due hint is adopted.
        let due = Utc::now() - chrono::Duration::seconds(1);
        provider.hint(due);
        assert_eq!(provider.next_job(), NextJob::At(due));

        // A later hint never replaces an earlier one.
        provider.hint(future);
        assert_eq!(provider.next_job(), NextJob::At(due));
    }

    #[tokio::test]
    async fn dispatches_reserved_jobs_and_reports_queue_empty() {
        let reserver = Arc::new(FakeReserver::default());
        reserver.push_batch(vec![sample_job()]);
        let repo = Arc::new(FakeJobRepo::default());
        let (provider, _executor, _pending) = test_provider(
            reserver.clone(),
            repo.clone(),
            Arc::new(FakeProbe::up()),
            Arc::new(NoopRunner),
            4,
        );

        let empties = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&empties);
        provider.set_queue_empty(Box::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));

        provider.start();
        wait_until(|| repo.completed_count() == 1).await;
        // Between executions the worker shell would call `poll`; do it by
        // hand here to provoke the empty reservation.
        provider.poll().expect("poll");
        wait_until(|| empties.load(Ordering::SeqCst) >= 1).await;
        provider.stop().await;

        let updates = repo.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, Some(JobStatus::Completed));
        assert_eq!(provider.next_job(), NextJob::Nothing);
    }

    #[tokio::test]
    async fn redispatches_abandoned_jobs_at_startup() {
        let reserver = Arc::new(FakeReserver::default());
        let orphan = sample_job();
        let orphan_id = orphan.id;
        reserver.set_abandoned(vec![orphan]);
        let repo = Arc::new(FakeJobRepo::default());
        let (provider, _executor, _pending) = test_provider(
            reserver,
            repo.clone(),
            Arc::new(FakeProbe::up()),
            Arc::new(NoopRunner),
            2,
        );

        provider.start();
        wait_until(|| repo.completed_count() == 1).await;
        provider.stop().await;

        assert_eq!(repo.updates()[0].0, orphan_id);
    }

    #[tokio::test]
    async fn flushes_buffered_updates_before_reserving() {
        let repo = Arc::new(FakeJobRepo::default());
        let reserver = Arc::new(FakeReserver::default());
        let (provider, _executor, pending) = test_provider(
            reserver,
            repo.clone(),
            Arc::new(FakeProbe::up()),
            Arc::new(NoopRunner),
            1,
        );

        let id = JobId::new();
        pending.push(
            id,
            PendingJobUpdate::Update(workhorse_db::JobUpdate::completed(1.25)),
        );
        let destroyed = JobId::new();
        pending.push(destroyed, PendingJobUpdate::Destroy);

        provider.start();
        wait_until(|| repo.updates().len() + repo.destroyed().len() == 2).await;
        provider.stop().await;

        assert!(pending.is_empty());
        assert_eq!(repo.destroyed(), vec![destroyed]);
        assert_eq!(repo.updates()[0].0, id);
    }

    #[tokio::test]
    async fn poll_errors_when_not_running() {
        let (provider, _executor, _pending) = test_provider(
            Arc::new(FakeReserver::default()),
            Arc::new(FakeJobRepo::default()),
            Arc::new(FakeProbe::up()),
            Arc::new(NoopRunner),
            1,
        );
        assert!(matches!(provider.poll(), Err(WorkerError::NotRunning)));
    }
}
