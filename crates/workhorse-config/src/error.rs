//! Configuration error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("polling jitter must be between 0 and 0.5, got {0}")]
    InvalidPollingJitter(f64),

    #[error("thread range must satisfy 1 <= min <= max, got {min}..{max}")]
    InvalidThreadRange { min: usize, max: usize },

    #[error("polling interval must be greater than zero")]
    ZeroPollingInterval,

    #[error(transparent)]
    Domain(#[from] workhorse_core::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
