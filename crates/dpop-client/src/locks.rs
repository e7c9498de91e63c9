//! Per-subject refresh serialization
//!
//! Refreshing rotates the refresh token, so two concurrent refreshes for the
//! same subject would race and one would present a spent token. Callers
//! take the subject's lock before refreshing; different subjects never
//! contend.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-subject async locks.
///
/// Entries nobody holds or waits on are pruned on the next acquisition.
#[derive(Default)]
pub struct SubjectLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `subject`.
    pub async fn lock(&self, subject: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(subject.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of tracked subjects.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
