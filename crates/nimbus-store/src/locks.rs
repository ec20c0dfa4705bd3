//! Per-item async locks.
//!
//! Every pipeline that mutates an item (FUSE writes, hydration,
//! upload, delta application, conflict resolution) serializes through
//! this map. Critical sections stay short; the only operations that
//! hold a lock across network I/O are the ones whose state-machine
//! contract requires it (hydration and upload own their item for the
//! duration of the transfer).

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use nimbus_core::ItemId;

/// Map of per-item mutexes, created on first use.
#[derive(Default)]
pub struct ItemLocks {
    locks: DashMap<ItemId, Arc<Mutex<()>>>,
}

impl ItemLocks {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, waiting if another task holds it.
    pub async fn lock(&self, id: &ItemId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Try to acquire without waiting; `None` when contended.
    pub fn try_lock(&self, id: &ItemId) -> Option<OwnedMutexGuard<()>> {
        let mutex = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.try_lock_owned().ok()
    }

    /// Move a lock entry when an item's id is rewritten (local id
    /// adoption). The old entry must not be held.
    pub fn rekey(&self, old: &ItemId, new: ItemId) {
        if let Some((_, mutex)) = self.locks.remove(old) {
            self.locks.insert(new, mutex);
        }
    }

    /// Number of tracked items (diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no locks have been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
