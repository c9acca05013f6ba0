//! User callback registry.
//!
//! A fixed set of callback points around enqueueing, job execution, worker
//! startup/shutdown, and error reporting. Handler errors are logged and never
//! escape the registry; a job must run (and a worker must stop) regardless of
//! how its observers behave.
//!
//! `around_*` handlers wrap an operation and must invoke the [`Continuation`]
//! they are given. A handler that completes without doing so is logged as a
//! missing-yield error and the continuation is executed afterwards anyway.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::job::{NewJob, ReservedJob};

pub type EnqueueHandler =
    Box<dyn for<'a> Fn(&'a NewJob) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;
pub type JobHandler =
    Box<dyn for<'a> Fn(&'a ReservedJob) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;
pub type FailureHandler = Box<
    dyn for<'a> Fn(&'a ReservedJob, &'a anyhow::Error) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
>;
pub type FatalHandler =
    Box<dyn for<'a> Fn(&'a anyhow::Error) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;
pub type LifecycleHandler = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type AroundEnqueueHandler = Box<
    dyn for<'a> Fn(&'a NewJob, Continuation<'a>) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
>;
pub type AroundJobHandler = Box<
    dyn for<'a> Fn(&'a ReservedJob, Continuation<'a>) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// The rest of an around-chain: the next handler, or the wrapped operation
/// itself. Consumed by [`Continuation::proceed`].
pub struct Continuation<'a> {
    slot: Arc<Mutex<Option<BoxFuture<'a, ()>>>>,
}

impl Continuation<'_> {
    /// Run the wrapped operation (through any remaining handlers).
    pub async fn proceed(self) {
        if let Some(rest) = take_slot(&self.slot) {
            rest.await;
        }
    }
}

fn take_slot<'a>(slot: &Mutex<Option<BoxFuture<'a, ()>>>) -> Option<BoxFuture<'a, ()>> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Registry of user callbacks, bound to one worker (or one enqueuer).
///
/// Handlers are registered before the owning worker starts and the registry
/// is shared behind an `Arc` afterwards.
#[derive(Default)]
pub struct HookRegistry {
    before_enqueue: Vec<EnqueueHandler>,
    around_enqueue: Vec<AroundEnqueueHandler>,
    after_enqueue: Vec<EnqueueHandler>,
    before_job_execution: Vec<JobHandler>,
    around_job_execution: Vec<AroundJobHandler>,
    after_job_execution: Vec<JobHandler>,
    on_job_failure: Vec<FailureHandler>,
    on_fatal_error: Vec<FatalHandler>,
    before_startup: Vec<LifecycleHandler>,
    after_startup: Vec<LifecycleHandler>,
    before_shutdown: Vec<LifecycleHandler>,
    after_shutdown: Vec<LifecycleHandler>,
    in_fatal_handler: AtomicBool,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before_enqueue", &self.before_enqueue.len())
            .field("around_enqueue", &self.around_enqueue.len())
            .field("after_enqueue", &self.after_enqueue.len())
            .field("before_job_execution", &self.before_job_execution.len())
            .field("around_job_execution", &self.around_job_execution.len())
            .field("after_job_execution", &self.after_job_execution.len())
            .field("on_job_failure", &self.on_job_failure.len())
            .field("on_fatal_error", &self.on_fatal_error.len())
            .finish_non_exhaustive()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_enqueue(&mut self, handler: EnqueueHandler) -> &mut Self {
        self.before_enqueue.push(handler);
        self
    }

    pub fn around_enqueue(&mut self, handler: AroundEnqueueHandler) -> &mut Self {
        self.around_enqueue.push(handler);
        self
    }

    pub fn after_enqueue(&mut self, handler: EnqueueHandler) -> &mut Self {
        self.after_enqueue.push(handler);
        self
    }

    pub fn before_job_execution(&mut self, handler: JobHandler) -> &mut Self {
        self.before_job_execution.push(handler);
        self
    }

    pub fn around_job_execution(&mut self, handler: AroundJobHandler) -> &mut Self {
        self.around_job_execution.push(handler);
        self
    }

    pub fn after_job_execution(&mut self, handler: JobHandler) -> &mut Self {
        self.after_job_execution.push(handler);
        self
    }

    pub fn on_job_failure(&mut self, handler: FailureHandler) -> &mut Self {
        self.on_job_failure.push(handler);
        self
    }

    pub fn on_fatal_error(&mut self, handler: FatalHandler) -> &mut Self {
        self.on_fatal_error.push(handler);
        self
    }

    pub fn before_startup(&mut self, handler: LifecycleHandler) -> &mut Self {
        self.before_startup.push(handler);
        self
    }

    pub fn after_startup(&mut self, handler: LifecycleHandler) -> &mut Self {
        self.after_startup.push(handler);
        self
    }

    pub fn before_shutdown(&mut self, handler: LifecycleHandler) -> &mut Self {
        self.before_shutdown.push(handler);
        self
    }

    pub fn after_shutdown(&mut self, handler: LifecycleHandler) -> &mut Self {
        self.after_shutdown.push(handler);
        self
    }

    pub async fn run_before_enqueue(&self, job: &NewJob) {
        for handler in &self.before_enqueue {
            log_failure("before_enqueue", handler(job).await);
        }
    }

    pub async fn run_after_enqueue(&self, job: &NewJob) {
        for handler in &self.after_enqueue {
            log_failure("after_enqueue", handler(job).await);
        }
    }

    /// Run `body` inside the `around_enqueue` chain.
    pub async fn run_around_enqueue<'a>(&'a self, job: &'a NewJob, body: BoxFuture<'a, ()>) {
        run_around(&self.around_enqueue, job, body, "around_enqueue").await;
    }

    pub async fn run_before_job_execution(&self, job: &ReservedJob) {
        for handler in &self.before_job_execution {
            log_failure("before_job_execution", handler(job).await);
        }
    }

    pub async fn run_after_job_execution(&self, job: &ReservedJob) {
        for handler in &self.after_job_execution {
            log_failure("after_job_execution", handler(job).await);
        }
    }

    /// Run `body` inside the `around_job_execution` chain.
    pub async fn run_around_job_execution<'a>(
        &'a self,
        job: &'a ReservedJob,
        body: BoxFuture<'a, ()>,
    ) {
        run_around(&self.around_job_execution, job, body, "around_job_execution").await;
    }

    /// Invoked for unexpected job errors; not for queue-time discards or
    /// execution timeouts.
    pub async fn run_on_job_failure(&self, job: &ReservedJob, error: &anyhow::Error) {
        for handler in &self.on_job_failure {
            log_failure("on_job_failure", handler(job, error).await);
        }
    }

    /// Invoked when a subcomponent exhausts its restart budget.
    ///
    /// A fatal error raised from within a fatal-error handler is suppressed
    /// (one-level re-entry guard) so reporting failures cannot loop.
    pub async fn run_on_fatal_error(&self, error: &anyhow::Error) {
        if self.in_fatal_handler.swap(true, Ordering::SeqCst) {
            debug!("suppressing recursive on_fatal_error");
            return;
        }
        for handler in &self.on_fatal_error {
            log_failure("on_fatal_error", handler(error).await);
        }
        self.in_fatal_handler.store(false, Ordering::SeqCst);
    }

    pub async fn run_before_startup(&self) {
        for handler in &self.before_startup {
            log_failure("before_startup", handler().await);
        }
    }

    pub async fn run_after_startup(&self) {
        for handler in &self.after_startup {
            log_failure("after_startup", handler().await);
        }
    }

    pub async fn run_before_shutdown(&self) {
        for handler in &self.before_shutdown {
            log_failure("before_shutdown", handler().await);
        }
    }

    pub async fn run_after_shutdown(&self) {
        for handler in &self.after_shutdown {
            log_failure("after_shutdown", handler().await);
        }
    }
}

fn log_failure(point: &'static str, result: anyhow::Result<()>) {
    if let Err(error) = result {
        warn!(hook = point, error = %error, "hook handler failed");
    }
}

/// Left-fold the around-handlers into a single future with `body` innermost.
fn run_around<'a, T, H>(
    handlers: &'a [H],
    subject: &'a T,
    body: BoxFuture<'a, ()>,
    point: &'static str,
) -> BoxFuture<'a, ()>
where
    T: Sync,
    H: for<'b> Fn(&'b T, Continuation<'b>) -> BoxFuture<'b, anyhow::Result<()>> + Send + Sync,
{
    Box::pin(async move {
        match handlers.split_first() {
            None => body.await,
            Some((handler, rest)) => {
                let inner = run_around(rest, subject, body, point);
                let slot = Arc::new(Mutex::new(Some(inner)));
                let continuation = Continuation {
                    slot: Arc::clone(&slot),
                };
                log_failure(point, handler(subject, continuation).await);
                if let Some(skipped) = take_slot(&slot) {
                    error!(hook = point, "around handler did not invoke its continuation");
                    skipped.await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;

    fn sample_job() -> ReservedJob {
        ReservedJob {
            id: crate::JobId::new(),
            active_job_id: uuid::Uuid::new_v4(),
            payload: serde_json::json!({"job": "sample"}),
            options: None,
            scheduled_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn around_handlers_nest_around_the_body() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        let outer = Arc::clone(&order);
        registry.around_job_execution(Box::new(move |_job, next| {
            let order = Arc::clone(&outer);
            Box::pin(async move {
                order.lock().unwrap().push("outer:before");
                next.proceed().await;
                order.lock().unwrap().push("outer:after");
                Ok(())
            })
        }));
        let inner = Arc::clone(&order);
        registry.around_job_execution(Box::new(move |_job, next| {
            let order = Arc::clone(&inner);
            Box::pin(async move {
                order.lock().unwrap().push("inner:before");
                next.proceed().await;
                order.lock().unwrap().push("inner:after");
                Ok(())
            })
        }));

        let job = sample_job();
        let body_order = Arc::clone(&order);
        registry
            .run_around_job_execution(
                &job,
                Box::pin(async move {
                    body_order.lock().unwrap().push("body");
                }),
            )
            .await;

        assert_eq!(
            *order.lock().unwrap(),
            vec![
                "outer:before",
                "inner:before",
                "body",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[tokio::test]
    async fn body_runs_even_when_a_handler_never_yields() {
        let mut registry = HookRegistry::new();
        registry.around_job_execution(Box::new(|_job, _next| Box::pin(async { Ok(()) })));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let job = sample_job();
        registry
            .run_around_job_execution(
                &job,
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                }),
            )
            .await;

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_the_chain() {
        let mut registry = HookRegistry::new();
        registry.around_job_execution(Box::new(|_job, _next| {
            Box::pin(async { Err(anyhow::anyhow!("observer broke")) })
        }));
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        registry.before_job_execution(Box::new(move |_job| {
            let calls = Arc::clone(&counted);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));

        let job = sample_job();
        registry.run_before_job_execution(&job).await;
        let body_calls = Arc::clone(&calls);
        registry
            .run_around_job_execution(
                &job,
                Box::pin(async move {
                    body_calls.fetch_add(10, Ordering::SeqCst);
                }),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn recursive_fatal_errors_are_suppressed() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static REGISTRY: OnceLock<Arc<HookRegistry>> = OnceLock::new();

        let mut registry = HookRegistry::new();
        registry.on_fatal_error(Box::new(|_error| {
            Box::pin(async {
                CALLS.fetch_add(1, Ordering::SeqCst);
                if let Some(registry) = REGISTRY.get() {
                    registry
                        .run_on_fatal_error(&anyhow::anyhow!("nested failure"))
                        .await;
                }
                Ok(())
            })
        }));
        let registry = Arc::new(registry);
        REGISTRY.set(Arc::clone(&registry)).ok();

        registry
            .run_on_fatal_error(&anyhow::anyhow!("original failure"))
            .await;
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        // The guard resets once the first invocation finishes.
        registry
            .run_on_fatal_error(&anyhow::anyhow!("later failure"))
            .await;
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }
}
