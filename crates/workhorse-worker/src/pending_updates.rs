//! Buffered job writes for surviving database outages.
//!
//! When an outcome write fails while the connection is confirmed down, the
//! intended update is parked here instead of being raised. The provider
//! drains the buffer at the start of each successful iteration.

use std::collections::HashMap;
use std::sync::Mutex;

use workhorse_core::JobId;
use workhorse_db::JobUpdate;

/// A buffered write: either a merged attribute update or the destroy
/// sentinel. Destroy absorbs any other value and is absorbed by nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingJobUpdate {
    Update(JobUpdate),
    Destroy,
}

/// Concurrent map of deferred job writes, keyed by job id.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    updates: Mutex<HashMap<JobId, PendingJobUpdate>>,
}

impl PendingUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a later update for a job, merging with anything already
    /// buffered.
    pub fn push(&self, id: JobId, update: PendingJobUpdate) {
        let mut updates = self.lock();
        match (updates.get_mut(&id), update) {
            // Destroy wins over anything, in either direction.
            (Some(PendingJobUpdate::Destroy), _) => {}
            (Some(entry), PendingJobUpdate::Destroy) => *entry = PendingJobUpdate::Destroy,
            (Some(PendingJobUpdate::Update(existing)), PendingJobUpdate::Update(later)) => {
                existing.merge(later);
            }
            (None, update) => {
                updates.insert(id, update);
            }
        }
    }

    /// Re-buffer an update whose flush failed. A newer entry for the same id
    /// keeps precedence over the restored value.
    pub fn restore(&self, id: JobId, update: PendingJobUpdate) {
        let mut updates = self.lock();
        match (updates.remove(&id), update) {
            (Some(PendingJobUpdate::Destroy), _) | (_, PendingJobUpdate::Destroy) => {
                updates.insert(id, PendingJobUpdate::Destroy);
            }
            (Some(PendingJobUpdate::Update(newer)), PendingJobUpdate::Update(mut restored)) => {
                restored.merge(newer);
                updates.insert(id, PendingJobUpdate::Update(restored));
            }
            (None, update) => {
                updates.insert(id, update);
            }
        }
    }

    /// Take every buffered update, leaving the buffer empty.
    pub fn drain(&self) -> Vec<(JobId, PendingJobUpdate)> {
        self.lock().drain().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, PendingJobUpdate>> {
        match self.updates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
