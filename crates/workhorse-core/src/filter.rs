//! Queue and priority filters.
//!
//! A worker only reserves jobs matching its filter. The same filter is used
//! client-side by the listener to drop notifications for jobs the worker
//! would never reserve.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{MAX_PRIORITY, MIN_PRIORITY, validate_priority, validate_queue_name};

/// Which queues a worker consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueFilter {
    /// All queues.
    #[default]
    Any,
    /// A single queue.
    Only(String),
    /// Any of a set of queues.
    In(Vec<String>),
}

/// Closed priority interval; either end may be omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityFilter {
    pub min: Option<i16>,
    pub max: Option<i16>,
}

/// The combined reservation filter of a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    queue: QueueFilter,
    priority: PriorityFilter,
}

impl JobFilter {
    /// Build a filter, validating queue names and the priority interval.
    ///
    /// An empty `queues` slice means no queue restriction. Invalid names and
    /// inverted intervals are rejected here, before any SQL is issued.
    pub fn build(queues: &[String], min_priority: Option<i16>, max_priority: Option<i16>) -> Result<Self> {
        for name in queues {
            validate_queue_name(name)?;
        }
        if let Some(min) = min_priority {
            validate_priority(min as i32)?;
        }
        if let Some(max) = max_priority {
            validate_priority(max as i32)?;
        }
        if let (Some(min), Some(max)) = (min_priority, max_priority) {
            if min > max {
                return Err(Error::InvalidPriorityRange { min, max });
            }
        }

        let queue = match queues {
            [] => QueueFilter::Any,
            [only] => QueueFilter::Only(only.clone()),
            many => QueueFilter::In(many.to_vec()),
        };
        Ok(Self {
            queue,
            priority: PriorityFilter {
                min: min_priority,
                max: max_priority,
            },
        })
    }

    /// True when a job with this routing would be reserved by the worker.
    pub fn matches(&self, queue: &str, priority: i16) -> bool {
        let queue_ok = match &self.queue {
            QueueFilter::Any => true,
            QueueFilter::Only(only) => only == queue,
            QueueFilter::In(set) => set.iter().any(|name| name == queue),
        };
        queue_ok && priority >= self.min_priority() && priority <= self.max_priority()
    }

    /// Queue names for an `= ANY($n)` bind, or `None` for no restriction.
    pub fn queue_names(&self) -> Option<Vec<String>> {
        match &self.queue {
            QueueFilter::Any => None,
            QueueFilter::Only(only) => Some(vec![only.clone()]),
            QueueFilter::In(set) => Some(set.clone()),
        }
    }

    pub fn min_priority(&self) -> i16 {
        self.priority.min.unwrap_or(MIN_PRIORITY)
    }

    pub fn max_priority(&self) -> i16 {
        self.priority.max.unwrap_or(MAX_PRIORITY)
    }
}
