//! Per-patient mutual exclusion.
//!
//! Any operation whose correctness depends on a patient existing (or not) for its whole duration
//! runs under that patient's lock: dependent creation, cascade delete, soft delete, status changes
//! and merges. Locks are process-local and held only for the local file operations of one call.

use crate::ids::PatientId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct PatientLocks {
    inner: Mutex<HashMap<PatientId, Arc<Mutex<()>>>>,
}

impl PatientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &PatientId) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(id.clone()).or_default().clone()
    }

    /// Run `f` while holding `id`'s lock.
    pub fn with_lock<R>(&self, id: &PatientId, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Run `f` while holding both locks, acquired in id order so two merges cannot deadlock.
    pub fn with_pair<R>(&self, a: &PatientId, b: &PatientId, f: impl FnOnce() -> R) -> R {
        if a == b {
            return self.with_lock(a, f);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock_for(first);
        let second = self.lock_for(second);
        let _g1 = first.lock().unwrap_or_else(PoisonError::into_inner);
        let _g2 = second.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Drop the lock entry of a patient that no longer exists.
    pub fn forget(&self, id: &PatientId) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(id);
    }
}
