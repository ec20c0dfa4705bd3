//! Inode number allocation and id mapping.
//!
//! The kernel speaks in inode numbers, the engine in item ids. This
//! table owns the bidirectional mapping for the lifetime of one mount;
//! numbers are not persisted (each mount renumbers, and the kernel's
//! cache is flushed on unmount). Inode 1 is the drive root.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nimbus_core::ItemId;

/// The root inode number, fixed by the FUSE protocol.
pub const ROOT_INO: u64 = 1;

/// First dynamically allocated inode number. The gap below leaves
/// room for the virtual-file inodes.
const FIRST_DYNAMIC_INO: u64 = 1024;

/// Bidirectional ino ⇄ item-id map.
pub struct InodeTable {
    by_ino: DashMap<u64, ItemId>,
    by_id: DashMap<ItemId, u64>,
    next: AtomicU64,
}

impl InodeTable {
    /// Create a table mapping the root inode to `root_id`.
    #[must_use]
    pub fn new(root_id: ItemId) -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_id: DashMap::new(),
            next: AtomicU64::new(FIRST_DYNAMIC_INO),
        };
        table.by_ino.insert(ROOT_INO, root_id.clone());
        table.by_id.insert(root_id, ROOT_INO);
        table
    }

    /// The item id behind an inode number.
    #[must_use]
    pub fn id_for(&self, ino: u64) -> Option<ItemId> {
        self.by_ino.get(&ino).map(|e| e.value().clone())
    }

    /// The inode number for an item, allocating one on first sight.
    pub fn ino_for(&self, id: &ItemId) -> u64 {
        if let Some(existing) = self.by_id.get(id) {
            return *existing.value();
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        self.by_id.insert(id.clone(), ino);
        self.by_ino.insert(ino, id.clone());
        ino
    }

    /// Drop the mapping for a deleted item.
    pub fn forget(&self, id: &ItemId) {
        if let Some((_, ino)) = self.by_id.remove(id) {
            self.by_ino.remove(&ino);
        }
    }

    /// Rewrite an id in place (provisional id adoption), keeping the
    /// inode number the kernel already knows.
    pub fn rekey(&self, old: &ItemId, new: ItemId) {
        if let Some((_, ino)) = self.by_id.remove(old) {
            self.by_ino.insert(ino, new.clone());
            self.by_id.insert(new, ino);
        }
    }

    /// Number of mapped inodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// Always false: the root mapping is permanent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}
