//! The listener: translates database notifications into provider wakeups.
//!
//! Holds one dedicated connection (via `PgListener`) subscribed to the
//! global `jobs_enqueued` channel and this worker's private control channel.
//! Payloads outside the worker's filter are dropped client-side; that is
//! sound because a job's `queue` and `priority` never change after insert.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use workhorse_core::backoff::{MAX_CONSECUTIVE_ERRORS, restart_delay};
use workhorse_core::hooks::HookRegistry;
use workhorse_core::{JobFilter, WorkerId};

use crate::component::{RuntimeState, StateCell};
use crate::error::WorkerResult;
use crate::notification::{JOBS_ENQUEUED_CHANNEL, JobNotification};
use crate::provider::Provider;

/// Upper bound on a single notification wait; the loop re-checks its
/// stop flag at least this often even if the doorbell never rings.
const WAIT_TIMEOUT: Duration = Duration::from_secs(100);

/// Listens for `jobs_enqueued` notifications and hints the provider.
pub struct Listener {
    inner: Arc<Inner>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    pool: PgPool,
    worker_id: WorkerId,
    filter: JobFilter,
    provider: Arc<Provider>,
    hooks: Arc<HookRegistry>,
    consecutive_errors: AtomicU32,
    state: StateCell,
    stop: CancellationToken,
}

impl Listener {
    pub fn new(
        pool: PgPool,
        worker_id: WorkerId,
        filter: JobFilter,
        provider: Arc<Provider>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                worker_id,
                filter,
                provider,
                hooks,
                consecutive_errors: AtomicU32::new(0),
                state: StateCell::new(),
                stop: CancellationToken::new(),
            }),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.state.get()
    }

    /// Start the listen loop. Idempotent.
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
    }

    /// Cooperative stop; waits for the loop to wind down.
    pub async fn stop(&self) {
        self.inner.stop.cancel();
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("listener stopped");
    }

    pub async fn join(&self) {
        self.inner.state.join().await;
    }
}

async fn run(inner: Arc<Inner>) {
    loop {
        if inner.stop.is_cancelled() {
            break;
        }
        match inner.listen_once().await {
            Ok(()) => break,
            Err(error) => {
                let errors = inner.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(error = %error, consecutive_errors = errors, "listener failed");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    inner.state.set(RuntimeState::Crashed);
                    inner
                        .hooks
                        .run_on_fatal_error(&anyhow::anyhow!(
                            "listener failed {errors} consecutive times, giving up: {error}"
                        ))
                        .await;
                    return;
                }
                let delay = restart_delay(errors);
                warn!(delay_secs = delay.as_secs_f64(), "listener restarting after back-off");
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
    async fn listen_once(&self) -> WorkerResult<()> {
        let control_channel = self.worker_id.control_channel();
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all([JOBS_ENQUEUED_CHANNEL, control_channel.as_str()])
            .await?;
        info!(worker_id = %self.worker_id, "listener started");
        self.consecutive_errors.store(0, Ordering::SeqCst);

        loop {
            let received = tokio::select! {
                _ = self.stop.cancelled() => break,
                received = tokio::time::timeout(WAIT_TIMEOUT, listener.try_recv()) => received,
            };
            let notification = match received {
                // Bounded wait elapsed; loop to re-check the stop flag.
                Err(_) => continue,
                // The underlying connection dropped and was re-established;
                // notifications may have been missed, so force a poll.
                Ok(Ok(None)) => {
                    warn!("listener connection was re-established; polling for missed jobs");
                    let _ = self.provider.refresh_next_job();
                    continue;
                }
                Ok(Ok(Some(notification))) => notification,
                Ok(Err(error)) => return Err(error.into()),
            };

            if notification.channel() == control_channel {
                info!("listener received a stop request on its control channel");
                break;
            }
            if self.stop.is_cancelled() {
                break;
            }

            match JobNotification::parse(notification.payload()) {
                Err(error) => {
                    error!(
                        payload = notification.payload(),
                        error = %error,
                        "dropping malformed job notification"
                    );
                }
                Ok(parsed) => {
                    if self.filter.matches(&parsed.queue, parsed.priority) {
                        debug!(job_id = %parsed.id, "job notification received");
                        self.provider.hint(parsed.scheduled_at);
                    } else {
                        trace!(job_id = %parsed.id, queue = %parsed.queue, "notification outside filter");
                    }
                }
            }
        }

        listener.unlisten_all().await.ok();
        Ok(())
    }
}
