//! Worker configuration for Workhorse.
//!
//! All validation happens when the configuration is built, before a worker
//! exists; nothing in this crate fails at runtime. File/environment loading
//! is left to the embedding application.

pub mod error;

pub use error::{ConfigError, ConfigResult};

use std::time::Duration;

use workhorse_core::JobFilter;
use workhorse_core::job::{DEFAULT_PRIORITY, validate_priority, validate_queue_name};

/// How long a clean stop waits for in-flight jobs before killing the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownWait {
    /// Wait until every in-flight job finishes.
    #[default]
    Indefinitely,
    /// Wait up to the given duration, then kill. Zero kills immediately.
    For(Duration),
}

/// Validated worker configuration.
///
/// Construct through [`WorkerConfig::builder`]; the builder's `build` step
/// performs every range check so invalid settings surface as
/// [`ConfigError`]s at configuration time.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    pub min_priority: Option<i16>,
    pub max_priority: Option<i16>,
    pub min_threads: usize,
    pub max_threads: usize,
    pub max_thread_idletime: Duration,
    pub polling_interval: Duration,
    pub polling_jitter: f64,
    pub enable_listener: bool,
    pub set_db_connection_name: bool,
    pub delete_completed_jobs: bool,
    pub delete_discarded_jobs: bool,
    pub delete_failed_jobs: bool,
    pub wait_for_termination: ShutdownWait,
    pub default_queue_priority: i16,
    pub healthcheck_timeout: Duration,
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    /// The reservation filter implied by `queues` and the priority bounds.
    pub fn job_filter(&self) -> JobFilter {
        // Validated in `build`, so this cannot fail afterwards.
        JobFilter::build(&self.queues, self.min_priority, self.max_priority)
            .unwrap_or_default()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfigBuilder::default()
            .build()
            .unwrap_or_else(|_| unreachable!("default configuration is valid"))
    }
}

/// Builder for [`WorkerConfig`]. Setters are chainable; `build` validates.
#[derive(Debug, Clone)]
pub struct WorkerConfigBuilder {
    queues: Vec<String>,
    min_priority: Option<i16>,
    max_priority: Option<i16>,
    min_threads: usize,
    max_threads: usize,
    max_thread_idletime: Duration,
    polling_interval: Duration,
    polling_jitter: f64,
    enable_listener: bool,
    set_db_connection_name: bool,
    delete_completed_jobs: bool,
    delete_discarded_jobs: bool,
    delete_failed_jobs: bool,
    wait_for_termination: ShutdownWait,
    default_queue_priority: i16,
    healthcheck_timeout: Duration,
}

impl Default for WorkerConfigBuilder {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            min_priority: None,
            max_priority: None,
            min_threads: 1,
            max_threads: 10,
            max_thread_idletime: Duration::from_secs(60),
            polling_interval: Duration::from_secs(60),
            polling_jitter: 0.1,
            enable_listener: true,
            set_db_connection_name: false,
            delete_completed_jobs: false,
            delete_discarded_jobs: false,
            delete_failed_jobs: false,
            wait_for_termination: ShutdownWait::For(Duration::from_secs(10)),
            default_queue_priority: DEFAULT_PRIORITY,
            healthcheck_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl WorkerConfigBuilder {
    pub fn queues(mut self, queues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_priority(mut self, priority: i16) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn max_priority(mut self, priority: i16) -> Self {
        self.max_priority = Some(priority);
        self
    }

    pub fn threads(mut self, min: usize, max: usize) -> Self {
        self.min_threads = min;
        self.max_threads = max;
        self
    }

    pub fn max_thread_idletime(mut self, idletime: Duration) -> Self {
        self.max_thread_idletime = idletime;
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn polling_jitter(mut self, jitter: f64) -> Self {
        self.polling_jitter = jitter;
        self
    }

    pub fn enable_listener(mut self, enabled: bool) -> Self {
        self.enable_listener = enabled;
        self
    }

    pub fn set_db_connection_name(mut self, enabled: bool) -> Self {
        self.set_db_connection_name = enabled;
        self
    }

    pub fn delete_completed_jobs(mut self, enabled: bool) -> Self {
        self.delete_completed_jobs = enabled;
        self
    }

    pub fn delete_discarded_jobs(mut self, enabled: bool) -> Self {
        self.delete_discarded_jobs = enabled;
        self
    }

    pub fn delete_failed_jobs(mut self, enabled: bool) -> Self {
        self.delete_failed_jobs = enabled;
        self
    }

    pub fn wait_for_termination(mut self, wait: ShutdownWait) -> Self {
        self.wait_for_termination = wait;
        self
    }

    pub fn default_queue_priority(mut self, priority: i16) -> Self {
        self.default_queue_priority = priority;
        self
    }

    pub fn healthcheck_timeout(mut self, timeout: Duration) -> Self {
        self.healthcheck_timeout = timeout;
        self
    }

    /// Validate every setting and produce the configuration.
    pub fn build(self) -> ConfigResult<WorkerConfig> {
        for queue in &self.queues {
            validate_queue_name(queue)?;
        }
        if let Some(min) = self.min_priority {
            validate_priority(min as i32)?;
        }
        if let Some(max) = self.max_priority {
            validate_priority(max as i32)?;
        }
        if let (Some(min), Some(max)) = (self.min_priority, self.max_priority) {
            if min > max {
                return Err(workhorse_core::Error::InvalidPriorityRange { min, max }.into());
            }
        }
        if self.min_threads == 0 || self.max_threads < self.min_threads {
            return Err(ConfigError::InvalidThreadRange {
                min: self.min_threads,
                max: self.max_threads,
            });
        }
        if self.polling_interval.is_zero() {
            return Err(ConfigError::ZeroPollingInterval);
        }
        if !(0.0..=0.5).contains(&self.polling_jitter) {
            return Err(ConfigError::InvalidPollingJitter(self.polling_jitter));
        }
        validate_priority(self.default_queue_priority as i32)?;

        Ok(WorkerConfig {
            queues: self.queues,
            min_priority: self.min_priority,
            max_priority: self.max_priority,
            min_threads: self.min_threads,
            max_threads: self.max_threads,
            max_thread_idletime: self.max_thread_idletime,
            polling_interval: self.polling_interval,
            polling_jitter: self.polling_jitter,
            enable_listener: self.enable_listener,
            set_db_connection_name: self.set_db_connection_name,
            delete_completed_jobs: self.delete_completed_jobs,
            delete_discarded_jobs: self.delete_discarded_jobs,
            delete_failed_jobs: self.delete_failed_jobs,
            wait_for_termination: self.wait_for_termination,
            default_queue_priority: self.default_queue_priority,
            healthcheck_timeout: self.healthcheck_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = WorkerConfig::default();
        assert_eq!(config.min_threads, 1);
        assert_eq!(config.max_threads, 10);
        assert_eq!(config.polling_interval, Duration::from_secs(60));
        assert!(config.enable_listener);
    }

    #[test]
    fn jitter_bounds() {
        assert!(WorkerConfig::builder().polling_jitter(0.0).build().is_ok());
        assert!(WorkerConfig::builder().polling_jitter(0.5).build().is_ok());
        assert!(matches!(
            WorkerConfig::builder().polling_jitter(0.6).build(),
            Err(ConfigError::InvalidPollingJitter(_))
        ));
        assert!(matches!(
            WorkerConfig::builder().polling_jitter(-0.1).build(),
            Err(ConfigError::InvalidPollingJitter(_))
        ));
    }

    #[test]
    fn thread_range_must_be_ordered_and_nonzero() {
        assert!(WorkerConfig::builder().threads(2, 2).build().is_ok());
        assert!(matches!(
            WorkerConfig::builder().threads(0, 4).build(),
            Err(ConfigError::InvalidThreadRange { .. })
        ));
        assert!(matches!(
            WorkerConfig::builder().threads(4, 2).build(),
            Err(ConfigError::InvalidThreadRange { .. })
        ));
    }

    #[test]
    fn priorities_are_checked_at_build_time() {
        assert!(WorkerConfig::builder().min_priority(1).max_priority(32767).build().is_ok());
        assert!(WorkerConfig::builder().min_priority(10).max_priority(5).build().is_err());
        assert!(WorkerConfig::builder().default_queue_priority(0).build().is_err());
    }

    #[test]
    fn queue_names_are_checked_at_build_time() {
        assert!(WorkerConfig::builder().queues(["mail"]).build().is_ok());
        assert!(WorkerConfig::builder().queues([""]).build().is_err());
        assert!(
            WorkerConfig::builder()
                .queues(["q".repeat(64)])
                .build()
                .is_err()
        );
    }

    #[test]
    fn job_filter_reflects_the_configuration() {
        let config = WorkerConfig::builder()
            .queues(["mail", "reports"])
            .min_priority(10)
            .build()
            .unwrap();
        let filter = config.job_filter();
        assert!(filter.matches("mail", 10));
        assert!(!filter.matches("mail", 9));
        assert!(!filter.matches("imports", 10));
    }
}
