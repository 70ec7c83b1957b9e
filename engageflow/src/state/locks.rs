//! Per-subject exclusive locks.
//!
//! Every read-modify-write cycle on a subject's pipeline state holds the
//! subject's lock. Locks are created on demand and dropped from the map once
//! nobody holds or waits for them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Registry of per-subject mutexes.
#[derive(Debug, Default, Clone)]
pub struct SubjectLocks {
    locks: Arc<LockMap>,
}

impl SubjectLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusive lock for a subject, waiting if necessary.
    pub async fn acquire(&self, subject_id: &str) -> SubjectLockGuard {
        let mutex = self
            .locks
            .entry(subject_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;

        SubjectLockGuard {
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
            subject_id: subject_id.to_string(),
        }
    }

    /// Returns the number of subjects with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no lock entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Holds a subject lock until dropped.
#[derive(Debug)]
pub struct SubjectLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
    subject_id: String,
}

impl Drop for SubjectLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or awaits the lock.
        self.locks
            .remove_if(&self.subject_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
