//! The application-side execution interface.

use async_trait::async_trait;

use crate::job::ReservedJob;

/// Executes the application payload of a reserved job.
///
/// The worker runtime is payload-agnostic: it hands the reserved job to the
/// runner and interprets the result. `Ok` marks the job completed, `Err`
/// marks it failed (and invokes the failure hooks), and a panic releases the
/// job back to `pending`. Execution timeouts and queue-time discards are
/// enforced by the executor before and around this call.
///
/// Implementations typically deserialize `job.payload` into their own command
/// type and dispatch on it.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &ReservedJob) -> anyhow::Result<()>;
}
