//! Non-blocking row locks on stale markers
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`; the store owns this table instead.
//! A worker holds a marker's guard for the lifetime of the transaction that
//! consumes it and drops it after commit or rollback.

use super::types::MarkerKey;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct RowLocks {
    held: Mutex<HashSet<MarkerKey>>,
}

impl RowLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lock `key` without waiting; `None` when another holder has it
    pub fn try_lock(self: &Arc<Self>, key: &MarkerKey) -> Option<RowLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.insert(*key) {
            Some(RowLockGuard {
                locks: Arc::clone(self),
                key: *key,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, key: &MarkerKey) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Releases the row lock on drop
#[derive(Debug)]
pub struct RowLockGuard {
    locks: Arc<RowLocks>,
    key: MarkerKey,
}

impl RowLockGuard {
    pub fn key(&self) -> &MarkerKey {
        &self.key
    }
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
