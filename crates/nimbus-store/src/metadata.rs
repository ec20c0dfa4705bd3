//! SQLite-backed metadata store.
//!
//! Owns the inode records. Every mutation happens inside a
//! transaction and is durable before it becomes visible; readers see
//! snapshot-consistent rows through WAL. The `(parent_id, name)` pair
//! is unique case-insensitively, enforced by the schema so the
//! invariant survives crashes and races.
//!
//! ## Type Mapping
//!
//! | Domain Type   | SQL Type | Strategy                              |
//! |---------------|----------|---------------------------------------|
//! | ItemId        | TEXT     | string via `as_str()` / `ItemId::new` |
//! | FileName      | TEXT     | string, `COLLATE NOCASE` in the index |
//! | ItemKind      | TEXT     | `"file"` / `"directory"`              |
//! | ItemState     | TEXT     | lowercase state name                  |
//! | DateTime<Utc> | TEXT     | RFC 3339 with nanoseconds             |
//! | ETag, hash    | TEXT     | opaque strings                        |

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use nimbus_core::domain::newtypes::{ContentHash, DeltaCursor, ETag, FileName, ItemId};
use nimbus_core::{ItemKind, ItemRecord, ItemState};

use crate::{StoreError, StorePool};

/// sync_state key holding the delta cursor.
const KEY_DELTA_CURSOR: &str = "delta_cursor";

/// sync_state key holding the drive root item id.
const KEY_ROOT_ID: &str = "root_id";

/// Persisted state of a resumable upload session.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSessionState {
    /// Session URL returned by the remote.
    pub upload_url: String,
    /// Total bytes the session will transfer.
    pub total_size: u64,
    /// Bytes the server has confirmed so far.
    pub bytes_confirmed: u64,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

/// The persistent store of inode records.
pub struct MetadataStore {
    pool: SqlitePool,
}

// ============================================================================
// Row mapping helpers
// ============================================================================

fn state_to_str(state: ItemState) -> &'static str {
    match state {
        ItemState::Ghost => "ghost",
        ItemState::Hydrating => "hydrating",
        ItemState::Hydrated => "hydrated",
        ItemState::DirtyLocal => "dirty",
        ItemState::Uploading => "uploading",
        ItemState::Conflict => "conflict",
    }
}

fn state_from_str(s: &str) -> Result<ItemState, StoreError> {
    match s {
        "ghost" => Ok(ItemState::Ghost),
        "hydrating" => Ok(ItemState::Hydrating),
        "hydrated" => Ok(ItemState::Hydrated),
        "dirty" => Ok(ItemState::DirtyLocal),
        "uploading" => Ok(ItemState::Uploading),
        "conflict" => Ok(ItemState::Conflict),
        other => Err(StoreError::Serialization(format!(
            "unknown item state: {other}"
        ))),
    }
}

fn kind_to_str(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::File => "file",
        ItemKind::Directory => "directory",
    }
}

fn kind_from_str(s: &str) -> Result<ItemKind, StoreError> {
    match s {
        "file" => Ok(ItemKind::File),
        "directory" => Ok(ItemKind::Directory),
        other => Err(StoreError::Serialization(format!(
            "unknown item kind: {other}"
        ))),
    }
}

fn datetime_to_str(dt: DateTime<Utc>) -> String {
    // Nanosecond precision keeps the remote's 100 ns timestamps exact.
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn datetime_from_str(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("failed to parse datetime '{s}': {e}")))
}

fn item_from_row(row: &SqliteRow) -> Result<ItemRecord, StoreError> {
    let id: String = row.get("id");
    let parent_id: String = row.get("parent_id");
    let name: String = row.get("name");
    let kind: String = row.get("kind");
    let size: i64 = row.get("size");
    let mtime: String = row.get("mtime");
    let etag: Option<String> = row.get("etag");
    let content_hash: Option<String> = row.get("content_hash");
    let state: String = row.get("state");
    let has_local_changes: i64 = row.get("has_local_changes");
    let last_error: Option<String> = row.get("last_error");

    let wrap = |e: nimbus_core::domain::DomainError| StoreError::Serialization(e.to_string());

    Ok(ItemRecord {
        id: ItemId::new(id).map_err(wrap)?,
        parent_id: ItemId::new(parent_id).map_err(wrap)?,
        name: FileName::new(name).map_err(wrap)?,
        kind: kind_from_str(&kind)?,
        size: size as u64,
        mtime: datetime_from_str(&mtime)?,
        etag: etag.map(ETag::new).transpose().map_err(wrap)?,
        content_hash: content_hash.map(ContentHash::new).transpose().map_err(wrap)?,
        state: state_from_str(&state)?,
        has_local_changes: has_local_changes != 0,
        last_error,
    })
}

fn map_unique_violation(err: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            return StoreError::NameConflict(what.to_string());
        }
    }
    StoreError::Database(err)
}

// ============================================================================
// MetadataStore
// ============================================================================

impl MetadataStore {
    /// Create a store over the given pool.
    pub fn new(pool: &StorePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Record operations
    // ------------------------------------------------------------------

    /// Fetch a record by id.
    pub async fn get(&self, id: &ItemId) -> Result<Option<ItemRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM items WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Fetch a record by `(parent, name)`, matching case-insensitively.
    pub async fn get_by_name(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<Option<ItemRecord>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM items WHERE parent_id = ? AND name = ? COLLATE NOCASE")
                .bind(parent_id.as_str())
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Upsert a record atomically, updating the name index.
    ///
    /// # Errors
    /// Returns `NameConflict` if a different item already holds the
    /// `(parent, name)` pair (case-insensitive).
    pub async fn put(&self, record: &ItemRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO items
                (id, parent_id, name, kind, size, mtime, etag, content_hash,
                 state, has_local_changes, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                name = excluded.name,
                kind = excluded.kind,
                size = excluded.size,
                mtime = excluded.mtime,
                etag = excluded.etag,
                content_hash = excluded.content_hash,
                state = excluded.state,
                has_local_changes = excluded.has_local_changes,
                last_error = excluded.last_error
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.parent_id.as_str())
        .bind(record.name.as_str())
        .bind(kind_to_str(record.kind))
        .bind(record.size as i64)
        .bind(datetime_to_str(record.mtime))
        .bind(record.etag.as_ref().map(|e| e.as_str().to_string()))
        .bind(record.content_hash.as_ref().map(|h| h.as_str().to_string()))
        .bind(state_to_str(record.state))
        .bind(record.has_local_changes as i64)
        .bind(record.last_error.clone())
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, record.name.as_str()))?;
        Ok(())
    }

    /// Children of a directory, ordered by name.
    pub async fn children(&self, parent_id: &ItemId) -> Result<Vec<ItemRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM items WHERE parent_id = ? ORDER BY name")
            .bind(parent_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Number of children of a directory.
    pub async fn child_count(&self, parent_id: &ItemId) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE parent_id = ?")
            .bind(parent_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Rename and/or move an item in one transaction.
    ///
    /// # Errors
    /// `NameConflict` if the destination name is taken by another item;
    /// `NotFound` if `id` does not exist.
    pub async fn rename(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &FileName,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let occupied = sqlx::query(
            "SELECT id FROM items WHERE parent_id = ? AND name = ? COLLATE NOCASE AND id != ?",
        )
        .bind(new_parent.as_str())
        .bind(new_name.as_str())
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if occupied.is_some() {
            return Err(StoreError::NameConflict(new_name.as_str().to_string()));
        }

        let result = sqlx::query("UPDATE items SET parent_id = ?, name = ? WHERE id = ?")
            .bind(new_parent.as_str())
            .bind(new_name.as_str())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique_violation(e, new_name.as_str()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a single record.
    pub async fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a record and every descendant.
    pub async fn delete_recursive(&self, id: &ItemId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            WITH RECURSIVE sub(id) AS (
                SELECT id FROM items WHERE id = ?
                UNION ALL
                SELECT items.id FROM items JOIN sub ON items.parent_id = sub.id
            )
            DELETE FROM items WHERE id IN (SELECT id FROM sub)
            "#,
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Rewrite a provisional `local-*` id to the server-assigned one,
    /// updating child parent references and journal entries in the
    /// same transaction.
    pub async fn adopt_id(
        &self,
        old_id: &ItemId,
        new_id: &ItemId,
        etag: Option<&ETag>,
        content_hash: Option<&ContentHash>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE items SET id = ?, etag = COALESCE(?, etag), content_hash = COALESCE(?, content_hash) WHERE id = ?",
        )
        .bind(new_id.as_str())
        .bind(etag.map(|e| e.as_str().to_string()))
        .bind(content_hash.map(|h| h.as_str().to_string()))
        .bind(old_id.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(old_id.to_string()));
        }

        sqlx::query("UPDATE items SET parent_id = ? WHERE parent_id = ?")
            .bind(new_id.as_str())
            .bind(old_id.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE journal SET item_id = ? WHERE item_id = ?")
            .bind(new_id.as_str())
            .bind(old_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(old = %old_id, new = %new_id, "Adopted server id");
        Ok(())
    }

    /// Update only the state column (and the dirty bit when the caller
    /// has already recomputed it).
    pub async fn set_state(
        &self,
        id: &ItemId,
        state: ItemState,
        has_local_changes: bool,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE items SET state = ?, has_local_changes = ? WHERE id = ?")
                .bind(state_to_str(state))
                .bind(has_local_changes as i64)
                .bind(id.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record or clear the per-item error marker.
    pub async fn set_error(&self, id: &ItemId, error: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE items SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All items currently in `state`.
    pub async fn items_in_state(&self, state: ItemState) -> Result<Vec<ItemRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM items WHERE state = ? ORDER BY mtime")
            .bind(state_to_str(state))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Directories created locally that still carry a provisional id
    /// (they must be created remotely before their children upload).
    pub async fn locally_created_directories(&self) -> Result<Vec<ItemRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM items
             WHERE kind = 'directory' AND id LIKE 'local-%' ORDER BY mtime",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Total record count.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Regress transfer states left over from a crash: `Hydrating`
    /// items become `Ghost`, `Uploading` items become `DirtyLocal`.
    /// Returns the number of regressed records.
    pub async fn recover_from_crash(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let hydrating = sqlx::query("UPDATE items SET state = 'ghost' WHERE state = 'hydrating'")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let uploading = sqlx::query(
            "UPDATE items SET state = 'dirty', has_local_changes = 1 WHERE state = 'uploading'",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        let total = hydrating + uploading;
        if total > 0 {
            tracing::info!(hydrating, uploading, "Regressed stale transfer states after crash");
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Sync state (delta cursor, root id)
    // ------------------------------------------------------------------

    /// The persisted delta cursor, if any.
    pub async fn delta_cursor(&self) -> Result<Option<DeltaCursor>, StoreError> {
        self.sync_state(KEY_DELTA_CURSOR)
            .await?
            .map(|v| {
                DeltaCursor::new(v).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()
    }

    /// Persist (or clear) the delta cursor. Durable before return, so
    /// a crash never replays past a committed cursor.
    pub async fn set_delta_cursor(&self, cursor: Option<&DeltaCursor>) -> Result<(), StoreError> {
        match cursor {
            Some(c) => self.set_sync_state(KEY_DELTA_CURSOR, c.as_str()).await,
            None => {
                sqlx::query("DELETE FROM sync_state WHERE key = ?")
                    .bind(KEY_DELTA_CURSOR)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        }
    }

    /// The drive root item id, once learned.
    pub async fn root_id(&self) -> Result<Option<ItemId>, StoreError> {
        self.sync_state(KEY_ROOT_ID)
            .await?
            .map(|v| ItemId::new(v).map_err(|e| StoreError::Serialization(e.to_string())))
            .transpose()
    }

    /// Persist the drive root item id.
    pub async fn set_root_id(&self, id: &ItemId) -> Result<(), StoreError> {
        self.set_sync_state(KEY_ROOT_ID, id.as_str()).await
    }

    async fn sync_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_sync_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upload sessions
    // ------------------------------------------------------------------

    /// Load a persisted upload session for `(parent, name)`.
    pub async fn load_upload_session(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<Option<UploadSessionState>, StoreError> {
        let row = sqlx::query(
            "SELECT upload_url, total_size, bytes_confirmed, created_at
             FROM upload_sessions WHERE parent_id = ? AND name = ?",
        )
        .bind(parent_id.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let created_at: String = row.get("created_at");
            Ok(UploadSessionState {
                upload_url: row.get("upload_url"),
                total_size: row.get::<i64, _>("total_size") as u64,
                bytes_confirmed: row.get::<i64, _>("bytes_confirmed") as u64,
                created_at: datetime_from_str(&created_at)?,
            })
        })
        .transpose()
    }

    /// Persist (or update) an upload session so a crash can resume it.
    pub async fn save_upload_session(
        &self,
        parent_id: &ItemId,
        name: &str,
        session: &UploadSessionState,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO upload_sessions
                 (parent_id, name, upload_url, total_size, bytes_confirmed, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(parent_id, name) DO UPDATE SET
                 upload_url = excluded.upload_url,
                 total_size = excluded.total_size,
                 bytes_confirmed = excluded.bytes_confirmed",
        )
        .bind(parent_id.as_str())
        .bind(name)
        .bind(&session.upload_url)
        .bind(session.total_size as i64)
        .bind(session.bytes_confirmed as i64)
        .bind(datetime_to_str(session.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a completed or abandoned upload session.
    pub async fn clear_upload_session(
        &self,
        parent_id: &ItemId,
        name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM upload_sessions WHERE parent_id = ? AND name = ?")
            .bind(parent_id.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn store() -> (StorePool, MetadataStore) {
        let pool = StorePool::in_memory().await.unwrap();
        let store = MetadataStore::new(&pool);
        (pool, store)
    }

    fn record(id: &str, parent: &str, name: &str) -> ItemRecord {
        ItemRecord::from_remote(
            ItemId::new(id.to_string()).unwrap(),
            ItemId::new(parent.to_string()).unwrap(),
            FileName::new(name.to_string()).unwrap(),
            ItemKind::File,
            42,
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
            Some(ETag::new("\"v1\"".to_string()).unwrap()),
            None,
        )
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_pool, store) = store().await;
        let rec = record("A1", "ROOT", "doc.txt");
        store.put(&rec).await.unwrap();

        let loaded = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_pool, store) = store().await;
        let id = ItemId::new("MISSING".to_string()).unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mtime_nanosecond_precision_survives() {
        let (_pool, store) = store().await;
        let mut rec = record("A1", "ROOT", "doc.txt");
        // 100 ns precision as reported by the remote.
        rec.mtime = Utc.timestamp_opt(1_700_000_000, 123_456_700).unwrap();
        store.put(&rec).await.unwrap();

        let loaded = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.mtime, rec.mtime);
    }

    #[tokio::test]
    async fn test_case_insensitive_name_collision() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "Doc.txt")).await.unwrap();

        let err = store.put(&record("A2", "ROOT", "doc.TXT")).await.unwrap_err();
        assert!(matches!(err, StoreError::NameConflict(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_same_name_different_parent_is_fine() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "doc.txt")).await.unwrap();
        store.put(&record("A2", "DIR1", "doc.txt")).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_by_name_ignores_case() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "Doc.txt")).await.unwrap();

        let parent = ItemId::new("ROOT".to_string()).unwrap();
        let found = store.get_by_name(&parent, "doc.TXT").await.unwrap().unwrap();
        assert_eq!(found.id.as_str(), "A1");
    }

    #[tokio::test]
    async fn test_children_ordered_by_name() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "b.txt")).await.unwrap();
        store.put(&record("A2", "ROOT", "a.txt")).await.unwrap();
        store.put(&record("A3", "ROOT", "c.txt")).await.unwrap();
        store.put(&record("A4", "OTHER", "z.txt")).await.unwrap();

        let parent = ItemId::new("ROOT".to_string()).unwrap();
        let kids = store.children(&parent).await.unwrap();
        let names: Vec<&str> = kids.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(store.child_count(&parent).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rename_moves_and_detects_conflict() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "a.txt")).await.unwrap();
        store.put(&record("A2", "ROOT", "b.txt")).await.unwrap();

        let id = ItemId::new("A1".to_string()).unwrap();
        let dir = ItemId::new("DIR1".to_string()).unwrap();
        let name = FileName::new("renamed.txt".to_string()).unwrap();
        store.rename(&id, &dir, &name).await.unwrap();

        let moved = store.get(&id).await.unwrap().unwrap();
        assert_eq!(moved.parent_id, dir);
        assert_eq!(moved.name.as_str(), "renamed.txt");

        // Renaming A2 onto an occupied (case-folded) name fails.
        let id2 = ItemId::new("A2".to_string()).unwrap();
        let clash = FileName::new("RENAMED.TXT".to_string()).unwrap();
        let err = store.rename(&id2, &dir, &clash).await.unwrap_err();
        assert!(matches!(err, StoreError::NameConflict(_)));
    }

    #[tokio::test]
    async fn test_rename_back_restores_initial_state() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "a.txt")).await.unwrap();
        let id = ItemId::new("A1".to_string()).unwrap();
        let root = ItemId::new("ROOT".to_string()).unwrap();

        let b = FileName::new("b.txt".to_string()).unwrap();
        let a = FileName::new("a.txt".to_string()).unwrap();
        store.rename(&id, &root, &b).await.unwrap();
        store.rename(&id, &root, &a).await.unwrap();

        let rec = store.get(&id).await.unwrap().unwrap();
        assert_eq!(rec.name.as_str(), "a.txt");
        assert_eq!(rec.parent_id, root);
    }

    #[tokio::test]
    async fn test_delete_recursive_cascades() {
        let (_pool, store) = store().await;
        let mut dir = record("D1", "ROOT", "dir");
        dir.kind = ItemKind::Directory;
        store.put(&dir).await.unwrap();
        store.put(&record("F1", "D1", "one.txt")).await.unwrap();
        let mut sub = record("D2", "D1", "sub");
        sub.kind = ItemKind::Directory;
        store.put(&sub).await.unwrap();
        store.put(&record("F2", "D2", "two.txt")).await.unwrap();
        store.put(&record("F3", "ROOT", "outside.txt")).await.unwrap();

        let removed = store
            .delete_recursive(&ItemId::new("D1".to_string()).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 4);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_adopt_id_rewrites_references() {
        let (_pool, store) = store().await;
        let local = ItemRecord::new_local(
            ItemId::new("ROOT".to_string()).unwrap(),
            FileName::new("newdir".to_string()).unwrap(),
            ItemKind::Directory,
        );
        let local_id = local.id.clone();
        store.put(&local).await.unwrap();

        // A child referencing the provisional parent id.
        let child = ItemRecord::new_local(
            local_id.clone(),
            FileName::new("inner.txt".to_string()).unwrap(),
            ItemKind::File,
        );
        let child_id = child.id.clone();
        store.put(&child).await.unwrap();

        let server = ItemId::new("SRV77".to_string()).unwrap();
        let etag = ETag::new("\"s1\"".to_string()).unwrap();
        store
            .adopt_id(&local_id, &server, Some(&etag), None)
            .await
            .unwrap();

        assert!(store.get(&local_id).await.unwrap().is_none());
        let adopted = store.get(&server).await.unwrap().unwrap();
        assert_eq!(adopted.etag, Some(etag));

        let child = store.get(&child_id).await.unwrap().unwrap();
        assert_eq!(child.parent_id, server);
    }

    #[tokio::test]
    async fn test_set_state_and_items_in_state() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "a.txt")).await.unwrap();
        let id = ItemId::new("A1".to_string()).unwrap();

        store.set_state(&id, ItemState::DirtyLocal, true).await.unwrap();
        let dirty = store.items_in_state(ItemState::DirtyLocal).await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert!(dirty[0].has_local_changes);
    }

    #[tokio::test]
    async fn test_crash_recovery_regresses_transfer_states() {
        let (_pool, store) = store().await;
        store.put(&record("A1", "ROOT", "a.txt")).await.unwrap();
        store.put(&record("A2", "ROOT", "b.txt")).await.unwrap();
        store.put(&record("A3", "ROOT", "c.txt")).await.unwrap();

        let a1 = ItemId::new("A1".to_string()).unwrap();
        let a2 = ItemId::new("A2".to_string()).unwrap();
        store.set_state(&a1, ItemState::Hydrating, false).await.unwrap();
        store.set_state(&a2, ItemState::Uploading, true).await.unwrap();

        let regressed = store.recover_from_crash().await.unwrap();
        assert_eq!(regressed, 2);
        assert_eq!(store.get(&a1).await.unwrap().unwrap().state, ItemState::Ghost);
        let a2_rec = store.get(&a2).await.unwrap().unwrap();
        assert_eq!(a2_rec.state, ItemState::DirtyLocal);
        assert!(a2_rec.has_local_changes);
    }

    #[tokio::test]
    async fn test_delta_cursor_roundtrip() {
        let (_pool, store) = store().await;
        assert!(store.delta_cursor().await.unwrap().is_none());

        let cursor = DeltaCursor::new("token-123".to_string()).unwrap();
        store.set_delta_cursor(Some(&cursor)).await.unwrap();
        assert_eq!(store.delta_cursor().await.unwrap(), Some(cursor));

        store.set_delta_cursor(None).await.unwrap();
        assert!(store.delta_cursor().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_root_id_roundtrip() {
        let (_pool, store) = store().await;
        let root = ItemId::new("ROOTID".to_string()).unwrap();
        store.set_root_id(&root).await.unwrap();
        assert_eq!(store.root_id().await.unwrap(), Some(root));
    }

    #[tokio::test]
    async fn test_upload_session_roundtrip() {
        let (_pool, store) = store().await;
        let parent = ItemId::new("ROOT".to_string()).unwrap();
        let session = UploadSessionState {
            upload_url: "https://up.example/session/1".to_string(),
            total_size: 10_000_000,
            bytes_confirmed: 3_276_800,
            created_at: Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap(),
        };
        store.save_upload_session(&parent, "big.bin", &session).await.unwrap();

        let loaded = store
            .load_upload_session(&parent, "big.bin")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, session);

        store.clear_upload_session(&parent, "big.bin").await.unwrap();
        assert!(store
            .load_upload_session(&parent, "big.bin")
            .await
            .unwrap()
            .is_none());
    }
}
