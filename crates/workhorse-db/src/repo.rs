//! Repository traits and PostgreSQL implementations.

pub mod cleanup;
pub mod jobs;
pub mod workers;

pub use cleanup::Cleaner;
pub use jobs::{JobRepo, JobUpdate, PgJobRepo};
pub use workers::{PgWorkerRepo, WorkerRepo};
