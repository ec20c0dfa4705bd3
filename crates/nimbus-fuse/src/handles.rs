//! Open file handle tracking.
//!
//! A handle remembers which item it refers to, whether it may write,
//! and whether a write has already been journaled for this open
//! session (so offline writes journal once per open, not once per
//! page). Open handles protect an item's content from cache eviction.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use nimbus_core::ItemId;

/// State of one open file handle.
#[derive(Debug, Clone)]
pub struct HandleEntry {
    /// The item the handle refers to.
    pub item_id: ItemId,
    /// Whether the open flags allow writing.
    pub writable: bool,
    /// Whether this handle has written since open.
    pub wrote: bool,
    /// Whether an offline write has been journaled for this session.
    pub journaled_write: bool,
    /// Virtual-file handles serve from memory and never sync.
    pub is_virtual: bool,
}

/// Allocates and tracks file handles.
pub struct HandleTable {
    entries: DashMap<u64, HandleEntry>,
    next: AtomicU64,
}

impl HandleTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a handle.
    pub fn open(&self, item_id: ItemId, writable: bool, is_virtual: bool) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            fh,
            HandleEntry {
                item_id,
                writable,
                wrote: false,
                journaled_write: false,
                is_virtual,
            },
        );
        fh
    }

    /// Look up a handle.
    #[must_use]
    pub fn get(&self, fh: u64) -> Option<HandleEntry> {
        self.entries.get(&fh).map(|e| e.value().clone())
    }

    /// Record a write on the handle. Returns true if this is the
    /// first journaled write of the session (the caller should append
    /// a journal entry when offline).
    pub fn record_write(&self, fh: u64, journal: bool) -> bool {
        let Some(mut entry) = self.entries.get_mut(&fh) else {
            return false;
        };
        entry.wrote = true;
        if journal && !entry.journaled_write {
            entry.journaled_write = true;
            return true;
        }
        false
    }

    /// Close a handle, returning its final state.
    pub fn close(&self, fh: u64) -> Option<HandleEntry> {
        self.entries.remove(&fh).map(|(_, entry)| entry)
    }

    /// Rewrite item ids after provisional id adoption.
    pub fn rekey(&self, old: &ItemId, new: &ItemId) {
        for mut entry in self.entries.iter_mut() {
            if &entry.item_id == old {
                entry.item_id = new.clone();
            }
        }
    }

    /// Ids with at least one open handle (protected from eviction).
    #[must_use]
    pub fn open_items(&self) -> HashSet<ItemId> {
        self.entries
            .iter()
            .map(|e| e.value().item_id.clone())
            .collect()
    }

    /// True if the item has any open handle.
    #[must_use]
    pub fn is_open(&self, id: &ItemId) -> bool {
        self.entries.iter().any(|e| &e.value().item_id == id)
    }

    /// Number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ItemId {
        ItemId::new(s.to_string()).unwrap()
    }

    #[test]
    fn test_open_close_lifecycle() {
        let table = HandleTable::new();
        let fh = table.open(id("A1"), true, false);
        assert!(table.get(fh).is_some());
        assert!(table.is_open(&id("A1")));

        let closed = table.close(fh).unwrap();
        assert!(!closed.wrote);
        assert!(!table.is_open(&id("A1")));
    }

    #[test]
    fn test_journal_once_per_session() {
        let table = HandleTable::new();
        let fh = table.open(id("A1"), true, false);

        assert!(table.record_write(fh, true));
        assert!(!table.record_write(fh, true));
        assert!(table.close(fh).unwrap().wrote);
    }

    #[test]
    fn test_open_items_protects_from_eviction() {
        let table = HandleTable::new();
        table.open(id("A1"), false, false);
        table.open(id("A1"), true, false);
        table.open(id("B1"), false, false);

        let open = table.open_items();
        assert_eq!(open.len(), 2);
        assert!(open.contains(&id("A1")));
    }

    #[test]
    fn test_rekey_updates_handles() {
        let table = HandleTable::new();
        let local = ItemId::local();
        let fh = table.open(local.clone(), true, false);

        table.rekey(&local, &id("SRV1"));
        assert_eq!(table.get(fh).unwrap().item_id, id("SRV1"));
    }
}
