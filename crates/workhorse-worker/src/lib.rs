//! Worker runtime for Workhorse.
//!
//! The moving parts:
//! - [`Listener`] holds a dedicated connection and turns `jobs_enqueued`
//!   notifications into provider hints.
//! - [`Provider`] arbitrates wakeups (hints, schedule times, the polling
//!   clock) and feeds reserved jobs to the executor.
//! - [`Executor`] runs jobs on a bounded pool and persists outcomes,
//!   buffering them when the database connection is down.
//! - [`Worker`] owns all of the above plus the worker record.

pub mod component;
pub mod error;
pub mod executor;
pub mod healthcheck;
pub mod listener;
pub mod notification;
pub mod pending_updates;
pub mod provider;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use component::RuntimeState;
pub use error::{WorkerError, WorkerResult};
pub use executor::Executor;
pub use listener::Listener;
pub use notification::{JOBS_ENQUEUED_CHANNEL, JobNotification};
pub use pending_updates::{PendingJobUpdate, PendingUpdates};
pub use provider::Provider;
pub use worker::Worker;
