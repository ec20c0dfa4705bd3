//! Graph API wire types.
//!
//! JSON shapes for drive items and their facets, delta/children pages,
//! upload sessions, and the notification subscription, plus the
//! conversion into the port-level [`RemoteItem`].
//!
//! See <https://learn.microsoft.com/en-us/graph/api/resources/driveitem>.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nimbus_core::domain::newtypes::{ContentHash, DeltaCursor, ETag, ItemId};
use nimbus_core::ports::remote_drive::{DeltaPage, RemoteItem};
use nimbus_core::NimbusError;

// ============================================================================
// DriveItem and facets
// ============================================================================

/// A drive item as returned by the Graph API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItemDto {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub size: Option<u64>,

    pub e_tag: Option<String>,

    pub last_modified_date_time: Option<DateTime<Utc>>,

    pub parent_reference: Option<ParentReferenceDto>,

    pub file: Option<FileFacetDto>,

    pub folder: Option<FolderFacetDto>,

    /// Present when the item has been deleted (delta responses).
    pub deleted: Option<DeletedFacetDto>,

    /// Present on the drive root entry.
    pub root: Option<serde_json::Value>,

    pub file_system_info: Option<FileSystemInfoDto>,
}

/// Reference to the containing item.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReferenceDto {
    pub id: Option<String>,
    #[allow(dead_code)]
    pub drive_id: Option<String>,
    #[allow(dead_code)]
    pub path: Option<String>,
}

/// File facet: present iff the item is a file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileFacetDto {
    pub hashes: Option<HashesDto>,
}

/// Content hashes for a file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashesDto {
    pub quick_xor_hash: Option<String>,
}

/// Folder facet: present iff the item is a folder.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacetDto {
    #[allow(dead_code)]
    pub child_count: Option<u64>,
}

/// Deleted facet: presence alone marks deletion.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletedFacetDto {
    #[allow(dead_code)]
    pub state: Option<String>,
}

/// Client-settable filesystem timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfoDto {
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

impl DriveItemDto {
    /// Convert to the port-level item.
    pub fn into_remote_item(self) -> Result<RemoteItem, NimbusError> {
        let id = ItemId::new(self.id).map_err(NimbusError::from)?;
        let parent_id = self
            .parent_reference
            .as_ref()
            .and_then(|p| p.id.clone())
            .map(ItemId::new)
            .transpose()
            .map_err(NimbusError::from)?;
        let etag = self.e_tag.map(ETag::new).transpose().map_err(NimbusError::from)?;
        let hash = self
            .file
            .as_ref()
            .and_then(|f| f.hashes.as_ref())
            .and_then(|h| h.quick_xor_hash.clone())
            .map(ContentHash::new)
            .transpose()
            // A malformed hash from the server is not fatal; hydration
            // will simply skip verification for this item.
            .unwrap_or_default();

        // fileSystemInfo carries the client-observed mtime; fall back
        // to the server-side timestamp.
        let modified = self
            .file_system_info
            .as_ref()
            .and_then(|i| i.last_modified_date_time)
            .or(self.last_modified_date_time);

        Ok(RemoteItem {
            id,
            name: self.name,
            parent_id,
            size: self.size.unwrap_or(0),
            etag,
            hash,
            modified,
            is_deleted: self.deleted.is_some(),
            is_directory: self.folder.is_some(),
            is_root: self.root.is_some(),
        })
    }
}

// ============================================================================
// Paged responses
// ============================================================================

/// A page of children or delta entries.
#[derive(Debug, Deserialize)]
pub struct PageDto {
    #[serde(default)]
    pub value: Vec<DriveItemDto>,

    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,

    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

impl PageDto {
    /// Convert a delta page, extracting the cursor from the delta link.
    pub fn into_delta_page(self) -> Result<DeltaPage, NimbusError> {
        let cursor = self
            .delta_link
            .as_deref()
            .and_then(extract_delta_token)
            .map(DeltaCursor::new)
            .transpose()
            .map_err(NimbusError::from)?;

        let items = self
            .value
            .into_iter()
            .map(DriveItemDto::into_remote_item)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DeltaPage {
            items,
            next_link: self.next_link,
            cursor,
        })
    }
}

/// Extract the `token` query parameter from a delta link URL.
#[must_use]
pub fn extract_delta_token(delta_link: &str) -> Option<String> {
    url::Url::parse(delta_link).ok().and_then(|u| {
        u.query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    })
}

// ============================================================================
// Upload sessions and subscriptions
// ============================================================================

/// Response from `createUploadSession`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionDto {
    pub upload_url: String,
    #[allow(dead_code)]
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// Progress response from an upload session PUT or status GET.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusDto {
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

impl UploadStatusDto {
    /// The lowest byte the server still expects, i.e. the resume
    /// offset. `None` when the server expects nothing more.
    #[must_use]
    pub fn resume_offset(&self) -> Option<u64> {
        self.next_expected_ranges
            .iter()
            .filter_map(|r| r.split('-').next())
            .filter_map(|s| s.parse::<u64>().ok())
            .min()
    }
}

/// Response from the notification subscription endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDto {
    pub notification_url: String,
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// Drive metadata (quota).
#[derive(Debug, Clone, Deserialize)]
pub struct DriveDto {
    pub quota: Option<QuotaDto>,
}

/// Storage quota figures.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaDto {
    pub total: Option<u64>,
    pub used: Option<u64>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_item_deserializes_and_converts() {
        let json = r#"{
            "id": "01ABCDEF",
            "name": "doc.txt",
            "size": 5,
            "eTag": "\"v1\"",
            "lastModifiedDateTime": "2026-03-14T09:26:53.1234567Z",
            "parentReference": {"id": "ROOT01", "driveId": "d1", "path": "/drive/root:"},
            "file": {"hashes": {"quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA="}}
        }"#;
        let dto: DriveItemDto = serde_json::from_str(json).unwrap();
        let item = dto.into_remote_item().unwrap();

        assert_eq!(item.id.as_str(), "01ABCDEF");
        assert_eq!(item.name, "doc.txt");
        assert_eq!(item.size, 5);
        assert!(!item.is_directory);
        assert!(!item.is_deleted);
        assert_eq!(item.parent_id.unwrap().as_str(), "ROOT01");
        assert!(item.hash.is_some());
        assert!(item.modified.is_some());
    }

    #[test]
    fn test_folder_and_deleted_facets() {
        let json = r#"{
            "id": "01FOLDER",
            "name": "dir",
            "folder": {"childCount": 3},
            "deleted": {"state": "deleted"}
        }"#;
        let item: DriveItemDto = serde_json::from_str(json).unwrap();
        let item = item.into_remote_item().unwrap();
        assert!(item.is_directory);
        assert!(item.is_deleted);
        assert_eq!(item.size, 0);
    }

    #[test]
    fn test_root_facet() {
        let json = r#"{"id": "01ROOT", "name": "root", "root": {}, "folder": {}}"#;
        let item: DriveItemDto = serde_json::from_str(json).unwrap();
        assert!(item.into_remote_item().unwrap().is_root);
    }

    #[test]
    fn test_malformed_hash_is_dropped_not_fatal() {
        let json = r#"{
            "id": "01BADHASH",
            "name": "f",
            "file": {"hashes": {"quickXorHash": "notbase64!!"}}
        }"#;
        let item: DriveItemDto = serde_json::from_str(json).unwrap();
        let item = item.into_remote_item().unwrap();
        assert!(item.hash.is_none());
    }

    #[test]
    fn test_delta_page_extracts_cursor() {
        let json = r#"{
            "value": [{"id": "A1", "name": "a", "file": {}}],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/me/drive/root/delta?token=tok123"
        }"#;
        let page: PageDto = serde_json::from_str(json).unwrap();
        let page = page.into_delta_page().unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_link.is_none());
        assert_eq!(page.cursor.unwrap().as_str(), "tok123");
    }

    #[test]
    fn test_delta_page_mid_stream_has_next_link() {
        let json = r#"{
            "value": [],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/me/drive/root/delta?token=page2"
        }"#;
        let page: PageDto = serde_json::from_str(json).unwrap();
        let page = page.into_delta_page().unwrap();
        assert!(page.cursor.is_none());
        assert!(page.next_link.is_some());
    }

    #[test]
    fn test_resume_offset_takes_minimum() {
        let status = UploadStatusDto {
            next_expected_ranges: vec!["26214400-".to_string(), "52428800-62914560".to_string()],
        };
        assert_eq!(status.resume_offset(), Some(26214400));

        let done = UploadStatusDto {
            next_expected_ranges: vec![],
        };
        assert_eq!(done.resume_offset(), None);
    }

    #[test]
    fn test_extract_delta_token_handles_garbage() {
        assert_eq!(extract_delta_token("not a url"), None);
        assert_eq!(
            extract_delta_token("https://x.example/delta?other=1"),
            None
        );
    }
}
