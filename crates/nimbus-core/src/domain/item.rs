//! Inode record entity and its hydration/dirty state machine.
//!
//! ## State Machine
//!
//! ```text
//! Ghost ──read──▶ Hydrating ──ok──▶ Hydrated
//!                     │                │  ▲
//!                     │          write │  │ evict / invalidate
//!                     │                ▼  │ (back to Ghost)
//!                     │          DirtyLocal ──flush──▶ Uploading
//!                     │                ▲                  │
//!                     │     newer remote while dirty      │ etag mismatch
//!                     │                │                  ▼
//!                     └──error──▶ Ghost└───────────── Conflict
//!                                                         │
//!                                                     resolve
//!                                                         ▼
//!                                              Hydrated | DirtyLocal
//! ```
//!
//! Rules enforced here:
//! - an item is never both downloading and uploading;
//! - `has_local_changes` is asserted by any write and only cleared by
//!   a confirmed upload or a resolution that discards local data;
//! - `Conflict` blocks further writes until resolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{ContentHash, ETag, FileName, ItemId};

// ============================================================================
// ItemKind
// ============================================================================

/// Filesystem object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Directory,
}

impl ItemKind {
    /// Returns true for directories.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, ItemKind::Directory)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::File => write!(f, "file"),
            ItemKind::Directory => write!(f, "directory"),
        }
    }
}

// ============================================================================
// ItemState
// ============================================================================

/// Hydration and synchronization state of an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Known to exist remotely, no local content.
    #[default]
    Ghost,
    /// Content download in progress.
    Hydrating,
    /// Content cached locally and in sync with the remote.
    Hydrated,
    /// Local content or metadata diverges from the last synced remote.
    DirtyLocal,
    /// An upload of the local content is in flight.
    Uploading,
    /// Local and remote both diverged from the last common version.
    Conflict,
}

impl ItemState {
    /// Returns true if a backing content file is required to exist.
    #[must_use]
    pub fn requires_content(&self) -> bool {
        matches!(
            self,
            ItemState::Hydrated | ItemState::DirtyLocal | ItemState::Uploading | ItemState::Conflict
        )
    }

    /// Returns true while a transfer pipeline owns the item.
    #[must_use]
    pub fn is_transferring(&self) -> bool {
        matches!(self, ItemState::Hydrating | ItemState::Uploading)
    }

    /// Returns true if local bytes may still need to reach the remote.
    #[must_use]
    pub fn has_pending_upload(&self) -> bool {
        matches!(self, ItemState::DirtyLocal | ItemState::Uploading)
    }

    /// Returns true if the item may be evicted from the content cache.
    ///
    /// Only clean hydrated content is lossy; everything else either has
    /// no content or content the remote does not have yet.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        matches!(self, ItemState::Hydrated)
    }

    /// Returns true if writes are currently refused.
    #[must_use]
    pub fn blocks_writes(&self) -> bool {
        matches!(self, ItemState::Conflict)
    }

    /// State name for diagnostics and transition errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Ghost => "Ghost",
            ItemState::Hydrating => "Hydrating",
            ItemState::Hydrated => "Hydrated",
            ItemState::DirtyLocal => "DirtyLocal",
            ItemState::Uploading => "Uploading",
            ItemState::Conflict => "Conflict",
        }
    }

    /// Checks whether a transition to `target` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, target: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (*self, target),
            // Read path
            (Ghost, Hydrating)
                | (Hydrating, Hydrated)
                | (Hydrating, Ghost) // download failed
                // Write path
                | (Hydrated, DirtyLocal)
                | (DirtyLocal, Uploading)
                | (Uploading, Hydrated) // upload confirmed
                | (Uploading, DirtyLocal) // retry or new write queued
                // Cache is lossy / remote invalidation
                | (Hydrated, Ghost)
                // Conflict detection
                | (Uploading, Conflict)
                | (DirtyLocal, Conflict)
                // Conflict resolution
                | (Conflict, Hydrated)
                | (Conflict, DirtyLocal)
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Ghost => write!(f, "ghost"),
            ItemState::Hydrating => write!(f, "hydrating"),
            ItemState::Hydrated => write!(f, "hydrated"),
            ItemState::DirtyLocal => write!(f, "dirty"),
            ItemState::Uploading => write!(f, "uploading"),
            ItemState::Conflict => write!(f, "conflict"),
        }
    }
}

// ============================================================================
// ItemRecord
// ============================================================================

/// The persistent record of one filesystem object.
///
/// Owned by the metadata store; pipelines mutate records only while
/// holding the per-item lock and persist them before releasing it.
/// State changes must go through [`ItemRecord::transition_to`] so that
/// the transition table and the `has_local_changes` coupling hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Stable remote id, or `local-<uuid>` until first upload.
    pub id: ItemId,
    /// Id of the containing directory.
    pub parent_id: ItemId,
    /// Name within the parent (unique case-insensitively).
    pub name: FileName,
    /// File or directory.
    pub kind: ItemKind,
    /// Declared byte length (0 for directories).
    pub size: u64,
    /// Last modification time as reported (100 ns precision kept).
    pub mtime: DateTime<Utc>,
    /// Remote version tag; absent for never-uploaded items.
    pub etag: Option<ETag>,
    /// Remote-declared quickXorHash; verified after hydration.
    pub content_hash: Option<ContentHash>,
    /// Current hydration/sync state.
    pub state: ItemState,
    /// True when content or metadata diverges from the last synced
    /// remote version.
    pub has_local_changes: bool,
    /// Last pipeline error, surfaced to the next accessor as EIO and
    /// cleared on the next successful operation.
    pub last_error: Option<String>,
}

impl ItemRecord {
    /// Record for an item learned from the remote (listing or delta).
    /// Starts as a `Ghost` with no local content.
    #[must_use]
    pub fn from_remote(
        id: ItemId,
        parent_id: ItemId,
        name: FileName,
        kind: ItemKind,
        size: u64,
        mtime: DateTime<Utc>,
        etag: Option<ETag>,
        content_hash: Option<ContentHash>,
    ) -> Self {
        Self {
            id,
            parent_id,
            name,
            kind,
            size,
            mtime,
            etag,
            content_hash,
            state: ItemState::Ghost,
            has_local_changes: false,
            last_error: None,
        }
    }

    /// Record for an item created locally (mknod/mkdir). Carries a
    /// provisional id and starts dirty so the upload manager picks it
    /// up; an empty backing file is expected to exist for files.
    #[must_use]
    pub fn new_local(parent_id: ItemId, name: FileName, kind: ItemKind) -> Self {
        Self {
            id: ItemId::local(),
            parent_id,
            name,
            kind,
            size: 0,
            mtime: Utc::now(),
            etag: None,
            content_hash: None,
            state: if kind.is_directory() {
                // Directories have no content to hydrate or upload as
                // bytes; they are created remotely by the metadata path.
                ItemState::Hydrated
            } else {
                ItemState::DirtyLocal
            },
            has_local_changes: true,
            last_error: None,
        }
    }

    /// Returns true for directories.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind.is_directory()
    }

    /// Attempt a state transition, keeping `has_local_changes`
    /// consistent with the target state.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidTransition` if the transition is
    /// not in the table.
    pub fn transition_to(&mut self, target: ItemState) -> Result<(), DomainError> {
        if !self.state.can_transition_to(target) {
            return Err(DomainError::InvalidTransition {
                from: self.state.name(),
                to: target.name(),
            });
        }

        match target {
            ItemState::DirtyLocal | ItemState::Conflict => {
                self.has_local_changes = true;
            }
            // A confirmed upload or a clean re-hydration means the
            // remote now has our bytes (or we accepted theirs).
            ItemState::Hydrated if self.state == ItemState::Uploading => {
                self.has_local_changes = false;
                self.last_error = None;
            }
            ItemState::Hydrated if self.state == ItemState::Hydrating => {
                self.last_error = None;
            }
            _ => {}
        }

        self.state = target;
        Ok(())
    }

    /// Record a write: asserts the dirty bit and, from `Hydrated`,
    /// moves to `DirtyLocal`. Writes while `Uploading` keep the state
    /// (the running upload sees a snapshot length) but stay dirty so a
    /// follow-up upload is scheduled.
    ///
    /// # Errors
    /// Returns `InvalidTransition` when the item is in `Conflict` or
    /// has no local content to write to.
    pub fn record_write(&mut self) -> Result<(), DomainError> {
        match self.state {
            ItemState::Hydrated => self.transition_to(ItemState::DirtyLocal),
            ItemState::DirtyLocal | ItemState::Uploading => {
                self.has_local_changes = true;
                Ok(())
            }
            _ => Err(DomainError::InvalidTransition {
                from: self.state.name(),
                to: ItemState::DirtyLocal.name(),
            }),
        }
    }

    /// Adopt the server-assigned id after the first successful upload.
    pub fn adopt_server_id(&mut self, id: ItemId, etag: Option<ETag>) {
        self.id = id;
        if etag.is_some() {
            self.etag = etag;
        }
    }

    /// Apply refreshed remote metadata without touching local state.
    pub fn apply_remote_metadata(
        &mut self,
        size: u64,
        mtime: DateTime<Utc>,
        etag: Option<ETag>,
        content_hash: Option<ContentHash>,
    ) {
        self.size = size;
        self.mtime = mtime;
        self.etag = etag;
        self.content_hash = content_hash;
    }

    /// Regress transfer states after a crash: a half-finished download
    /// becomes a `Ghost` again, a half-finished upload stays dirty.
    pub fn recover_from_crash(&mut self) {
        match self.state {
            ItemState::Hydrating => self.state = ItemState::Ghost,
            ItemState::Uploading => self.state = ItemState::DirtyLocal,
            _ => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_file() -> ItemRecord {
        ItemRecord::from_remote(
            ItemId::new("REMOTE1".to_string()).unwrap(),
            ItemId::new("PARENT1".to_string()).unwrap(),
            FileName::new("doc.txt".to_string()).unwrap(),
            ItemKind::File,
            5,
            Utc::now(),
            Some(ETag::new("\"v1\"".to_string()).unwrap()),
            None,
        )
    }

    mod state_tests {
        use super::*;

        #[test]
        fn test_requires_content() {
            assert!(!ItemState::Ghost.requires_content());
            assert!(!ItemState::Hydrating.requires_content());
            assert!(ItemState::Hydrated.requires_content());
            assert!(ItemState::DirtyLocal.requires_content());
            assert!(ItemState::Uploading.requires_content());
            assert!(ItemState::Conflict.requires_content());
        }

        #[test]
        fn test_hydrating_and_uploading_are_disjoint() {
            // A single state field makes the overlap structurally
            // unreachable; the transition table must not bridge them.
            assert!(!ItemState::Hydrating.can_transition_to(ItemState::Uploading));
            assert!(!ItemState::Uploading.can_transition_to(ItemState::Hydrating));
        }

        #[test]
        fn test_read_path_transitions() {
            assert!(ItemState::Ghost.can_transition_to(ItemState::Hydrating));
            assert!(ItemState::Hydrating.can_transition_to(ItemState::Hydrated));
            assert!(ItemState::Hydrating.can_transition_to(ItemState::Ghost));
            assert!(!ItemState::Ghost.can_transition_to(ItemState::Hydrated));
        }

        #[test]
        fn test_write_path_transitions() {
            assert!(ItemState::Hydrated.can_transition_to(ItemState::DirtyLocal));
            assert!(ItemState::DirtyLocal.can_transition_to(ItemState::Uploading));
            assert!(ItemState::Uploading.can_transition_to(ItemState::Hydrated));
            assert!(ItemState::Uploading.can_transition_to(ItemState::Conflict));
            assert!(!ItemState::DirtyLocal.can_transition_to(ItemState::Hydrated));
        }

        #[test]
        fn test_eviction_only_from_hydrated() {
            assert!(ItemState::Hydrated.is_evictable());
            assert!(ItemState::Hydrated.can_transition_to(ItemState::Ghost));
            assert!(!ItemState::DirtyLocal.is_evictable());
            assert!(!ItemState::DirtyLocal.can_transition_to(ItemState::Ghost));
            assert!(!ItemState::Conflict.can_transition_to(ItemState::Ghost));
        }

        #[test]
        fn test_conflict_resolution_targets() {
            assert!(ItemState::Conflict.can_transition_to(ItemState::Hydrated));
            assert!(ItemState::Conflict.can_transition_to(ItemState::DirtyLocal));
            assert!(!ItemState::Conflict.can_transition_to(ItemState::Uploading));
            assert!(ItemState::Conflict.blocks_writes());
        }
    }

    mod record_tests {
        use super::*;

        #[test]
        fn test_remote_item_starts_ghost_and_clean() {
            let item = remote_file();
            assert_eq!(item.state, ItemState::Ghost);
            assert!(!item.has_local_changes);
            assert!(item.etag.is_some());
        }

        #[test]
        fn test_local_file_starts_dirty_with_local_id() {
            let item = ItemRecord::new_local(
                ItemId::new("PARENT1".to_string()).unwrap(),
                FileName::new("new.txt".to_string()).unwrap(),
                ItemKind::File,
            );
            assert!(item.id.is_local());
            assert_eq!(item.state, ItemState::DirtyLocal);
            assert!(item.has_local_changes);
            assert!(item.etag.is_none());
        }

        #[test]
        fn test_local_directory_starts_hydrated() {
            let item = ItemRecord::new_local(
                ItemId::new("PARENT1".to_string()).unwrap(),
                FileName::new("newdir".to_string()).unwrap(),
                ItemKind::Directory,
            );
            assert_eq!(item.state, ItemState::Hydrated);
            assert!(item.has_local_changes);
        }

        #[test]
        fn test_invalid_transition_is_rejected() {
            let mut item = remote_file();
            let err = item.transition_to(ItemState::Uploading).unwrap_err();
            assert!(matches!(err, DomainError::InvalidTransition { .. }));
            assert_eq!(item.state, ItemState::Ghost);
        }

        #[test]
        fn test_write_read_upload_cycle() {
            let mut item = remote_file();
            item.transition_to(ItemState::Hydrating).unwrap();
            item.transition_to(ItemState::Hydrated).unwrap();

            item.record_write().unwrap();
            assert_eq!(item.state, ItemState::DirtyLocal);
            assert!(item.has_local_changes);

            item.transition_to(ItemState::Uploading).unwrap();
            item.transition_to(ItemState::Hydrated).unwrap();
            assert!(!item.has_local_changes);
        }

        #[test]
        fn test_write_during_upload_stays_dirty() {
            let mut item = remote_file();
            item.transition_to(ItemState::Hydrating).unwrap();
            item.transition_to(ItemState::Hydrated).unwrap();
            item.record_write().unwrap();
            item.transition_to(ItemState::Uploading).unwrap();

            // Another write lands while the upload is in flight.
            item.record_write().unwrap();
            assert_eq!(item.state, ItemState::Uploading);
            assert!(item.has_local_changes);
        }

        #[test]
        fn test_write_on_conflict_rejected() {
            let mut item = remote_file();
            item.transition_to(ItemState::Hydrating).unwrap();
            item.transition_to(ItemState::Hydrated).unwrap();
            item.record_write().unwrap();
            item.transition_to(ItemState::Conflict).unwrap();

            assert!(item.record_write().is_err());
        }

        #[test]
        fn test_write_on_ghost_rejected() {
            let mut item = remote_file();
            assert!(item.record_write().is_err());
        }

        #[test]
        fn test_crash_recovery_regression() {
            let mut item = remote_file();
            item.transition_to(ItemState::Hydrating).unwrap();
            item.recover_from_crash();
            assert_eq!(item.state, ItemState::Ghost);

            let mut item = remote_file();
            item.transition_to(ItemState::Hydrating).unwrap();
            item.transition_to(ItemState::Hydrated).unwrap();
            item.record_write().unwrap();
            item.transition_to(ItemState::Uploading).unwrap();
            item.recover_from_crash();
            assert_eq!(item.state, ItemState::DirtyLocal);
            assert!(item.has_local_changes);
        }

        #[test]
        fn test_adopt_server_id() {
            let mut item = ItemRecord::new_local(
                ItemId::new("PARENT1".to_string()).unwrap(),
                FileName::new("new.txt".to_string()).unwrap(),
                ItemKind::File,
            );
            let server = ItemId::new("SERVER9".to_string()).unwrap();
            item.adopt_server_id(server.clone(), Some(ETag::new("\"v1\"".to_string()).unwrap()));
            assert_eq!(item.id, server);
            assert!(!item.id.is_local());
            assert!(item.etag.is_some());
        }

        #[test]
        fn test_upload_success_clears_error() {
            let mut item = remote_file();
            item.transition_to(ItemState::Hydrating).unwrap();
            item.transition_to(ItemState::Hydrated).unwrap();
            item.record_write().unwrap();
            item.last_error = Some("transient".to_string());
            item.transition_to(ItemState::Uploading).unwrap();
            item.transition_to(ItemState::Hydrated).unwrap();
            assert!(item.last_error.is_none());
        }

        #[test]
        fn test_serde_roundtrip() {
            let item = remote_file();
            let json = serde_json::to_string(&item).unwrap();
            let back: ItemRecord = serde_json::from_str(&json).unwrap();
            assert_eq!(item, back);
        }
    }
}
