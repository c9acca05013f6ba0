//! Error types for Workhorse domain validation.

use thiserror::Error;

use crate::job::MAX_QUEUE_NAME_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("queue name must not be empty")]
    EmptyQueueName,

    #[error("queue name exceeds {MAX_QUEUE_NAME_LEN} characters: {0:?}")]
    QueueNameTooLong(String),

    #[error("priority must be between 1 and 32767, got {0}")]
    PriorityOutOfRange(i32),

    #[error("minimum priority {min} is greater than maximum priority {max}")]
    InvalidPriorityRange { min: i16, max: i16 },
}

pub type Result<T> = std::result::Result<T, Error>;
