//! Remote drive port (driven/secondary port).
//!
//! The interface through which every pipeline talks to the cloud
//! store. The production implementation lives in `nimbus-graph`;
//! tests use in-memory fakes. DTOs here are port-level: the delta
//! loop and metadata queue map them onto [`ItemRecord`]s.
//!
//! [`ItemRecord`]: crate::domain::ItemRecord

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::domain::newtypes::{ContentHash, DeltaCursor, ETag, ItemId};
use crate::errors::NimbusError;

// ============================================================================
// DTOs
// ============================================================================

/// A drive item as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Server-assigned identifier.
    pub id: ItemId,
    /// Item name.
    pub name: String,
    /// Parent item id (None only for the drive root itself).
    pub parent_id: Option<ItemId>,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Version tag.
    pub etag: Option<ETag>,
    /// quickXorHash (files only).
    pub hash: Option<ContentHash>,
    /// Last modified time as reported by the server.
    pub modified: Option<DateTime<Utc>>,
    /// True if this entry marks a deletion (delta responses only).
    pub is_deleted: bool,
    /// True for folders.
    pub is_directory: bool,
    /// True for the drive root entry in a delta stream.
    pub is_root: bool,
}

/// One page of a delta query.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    /// Changed items, in server order.
    pub items: Vec<RemoteItem>,
    /// Link to the next page, if more pages exist.
    pub next_link: Option<String>,
    /// Cursor for the next sync cycle (present only on the last page).
    pub cursor: Option<DeltaCursor>,
}

/// Metadata fields a PATCH may change.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    /// New name (rename).
    pub name: Option<String>,
    /// New parent id (move).
    pub parent_id: Option<ItemId>,
    /// New modification time.
    pub mtime: Option<DateTime<Utc>>,
}

/// Drive storage quota.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveQuota {
    pub used: u64,
    pub total: u64,
}

/// Where the realtime transport should connect.
#[derive(Debug, Clone)]
pub struct RealtimeEndpoint {
    /// Notification endpoint URL as returned by the subscription API.
    pub url: String,
    /// When the subscription expires and must be renewed.
    pub expires: Option<DateTime<Utc>>,
}

// ============================================================================
// RemoteDrive trait
// ============================================================================

/// Operations against the remote drive.
///
/// Implementations own retry-with-backoff for transient failures and
/// map the wire error space into [`NimbusError`]; callers only see the
/// taxonomy. All calls may return `Offline`.
#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Fetch a single item's metadata by id.
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, NimbusError>;

    /// Fetch a single item's metadata by drive-root-relative path
    /// (e.g. `/Documents/notes.txt`).
    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, NimbusError>;

    /// Fetch the drive root item.
    async fn get_root(&self) -> Result<RemoteItem, NimbusError>;

    /// List a directory's children. `next` continues a previous page;
    /// the returned link is `None` on the last page.
    async fn list_children(
        &self,
        id: &ItemId,
        next: Option<&str>,
    ) -> Result<(Vec<RemoteItem>, Option<String>), NimbusError>;

    /// Stream an item's content into `sink`, returning the byte count.
    /// Implementations verify the declared quickXorHash when one is
    /// known and fail with `Integrity` on mismatch.
    async fn download(
        &self,
        id: &ItemId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, NimbusError>;

    /// PATCH metadata (rename/move/mtime). `if_match` guards against
    /// concurrent remote changes.
    async fn patch_item(
        &self,
        id: &ItemId,
        patch: &ItemPatch,
        if_match: Option<&ETag>,
    ) -> Result<RemoteItem, NimbusError>;

    /// Create a directory under `parent_id`.
    async fn create_folder(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, NimbusError>;

    /// Upload small content (≤ 4 MiB) in one request. `item_id` is
    /// `Some` to replace an existing item's content, `None` to create
    /// `name` under `parent_id`.
    async fn upload_small(
        &self,
        parent_id: &ItemId,
        item_id: Option<&ItemId>,
        name: &str,
        data: &[u8],
        if_match: Option<&ETag>,
    ) -> Result<RemoteItem, NimbusError>;

    /// Upload large content through a resumable session, reading from
    /// the file at `source`. Crash-resume state is persisted by the
    /// implementation, keyed by `(parent_id, name)`.
    async fn upload_session(
        &self,
        parent_id: &ItemId,
        name: &str,
        source: &std::path::Path,
        if_match: Option<&ETag>,
    ) -> Result<RemoteItem, NimbusError>;

    /// One page of the change stream. `cursor = None` starts a full
    /// enumeration; follow `next_link` via [`RemoteDrive::delta_next`]
    /// until a page carries a cursor.
    async fn delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaPage, NimbusError>;

    /// Follow a delta `next_link`.
    async fn delta_next(&self, next_link: &str) -> Result<DeltaPage, NimbusError>;

    /// Delete an item. `if_match` guards against deleting a version we
    /// have not seen.
    async fn remove(&self, id: &ItemId, if_match: Option<&ETag>) -> Result<(), NimbusError>;

    /// Create (or renew) the change-notification subscription and
    /// return the realtime endpoint.
    async fn subscribe(&self) -> Result<RealtimeEndpoint, NimbusError>;

    /// Drive quota, for statfs.
    async fn quota(&self) -> Result<DriveQuota, NimbusError>;
}
