//! Offline journal.
//!
//! While the drive is unreachable (heuristic or operational offline),
//! mutations are appended here instead of being pushed to the upload
//! path. The journal lives in the same SQLite database as the
//! metadata, so WAL durability covers it; entries are replayed in
//! insertion order on reconnection and the journal is truncated once
//! replay completes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use nimbus_core::domain::newtypes::{FileName, ItemId};
use nimbus_core::ItemKind;

use crate::{StoreError, StorePool};

/// A mutation recorded while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    /// Item created locally.
    Create {
        parent_id: ItemId,
        name: FileName,
        kind: ItemKind,
    },
    /// Content written; the backing file holds the bytes.
    Write { size: u64 },
    /// Renamed and/or moved.
    Rename {
        new_parent_id: ItemId,
        new_name: FileName,
    },
    /// Deleted locally.
    Delete,
    /// Modification time changed.
    SetMtime { mtime: DateTime<Utc> },
}

impl JournalOp {
    /// Short operation name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            JournalOp::Create { .. } => "create",
            JournalOp::Write { .. } => "write",
            JournalOp::Rename { .. } => "rename",
            JournalOp::Delete => "delete",
            JournalOp::SetMtime { .. } => "set_mtime",
        }
    }
}

/// A journal row.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Monotonic sequence number (replay order).
    pub seq: i64,
    /// When the mutation was recorded.
    pub recorded_at: DateTime<Utc>,
    /// The item the mutation applies to.
    pub item_id: ItemId,
    /// The mutation itself.
    pub op: JournalOp,
}

/// Durable record of offline mutations.
pub struct Journal {
    pool: SqlitePool,
}

impl Journal {
    /// Create a journal over the given pool.
    pub fn new(pool: &StorePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Append a mutation. Durable before return.
    pub async fn append(&self, item_id: &ItemId, op: &JournalOp) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(op)
            .map_err(|e| StoreError::Serialization(format!("journal op encode: {e}")))?;
        let result = sqlx::query(
            "INSERT INTO journal (recorded_at, item_id, op) VALUES (?, ?, ?)",
        )
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true))
        .bind(item_id.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        tracing::debug!(item = %item_id, op = op.name(), "Journaled offline mutation");
        Ok(result.last_insert_rowid())
    }

    /// All entries in replay order.
    pub async fn entries(&self) -> Result<Vec<JournalEntry>, StoreError> {
        let rows = sqlx::query("SELECT seq, recorded_at, item_id, op FROM journal ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let recorded_at: String = row.get("recorded_at");
                let item_id: String = row.get("item_id");
                let op: String = row.get("op");
                Ok(JournalEntry {
                    seq: row.get("seq"),
                    recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            StoreError::Serialization(format!("journal timestamp: {e}"))
                        })?,
                    item_id: ItemId::new(item_id)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    op: serde_json::from_str(&op)
                        .map_err(|e| StoreError::Serialization(format!("journal op decode: {e}")))?,
                })
            })
            .collect()
    }

    /// Number of pending entries.
    pub async fn len(&self) -> Result<u64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM journal")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// True when nothing is pending.
    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Remove entries up to and including `seq` (after they replayed).
    pub async fn truncate_through(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM journal WHERE seq <= ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop all entries (after a full replay).
    pub async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM journal").execute(&self.pool).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn journal() -> (StorePool, Journal) {
        let pool = StorePool::in_memory().await.unwrap();
        let journal = Journal::new(&pool);
        (pool, journal)
    }

    fn id(s: &str) -> ItemId {
        ItemId::new(s.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let (_pool, journal) = journal().await;

        journal
            .append(
                &id("A1"),
                &JournalOp::Create {
                    parent_id: id("ROOT"),
                    name: FileName::new("new.txt".to_string()).unwrap(),
                    kind: ItemKind::File,
                },
            )
            .await
            .unwrap();
        journal
            .append(&id("A1"), &JournalOp::Write { size: 1 })
            .await
            .unwrap();
        journal
            .append(
                &id("A2"),
                &JournalOp::Rename {
                    new_parent_id: id("ROOT"),
                    new_name: FileName::new("moved.txt".to_string()).unwrap(),
                },
            )
            .await
            .unwrap();

        let entries = journal.entries().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(entries[0].op.name(), "create");
        assert_eq!(entries[1].op.name(), "write");
        assert_eq!(entries[2].op.name(), "rename");
    }

    #[tokio::test]
    async fn test_truncate_through_keeps_tail() {
        let (_pool, journal) = journal().await;
        for i in 0..4u64 {
            journal
                .append(&id("A1"), &JournalOp::Write { size: i })
                .await
                .unwrap();
        }

        let entries = journal.entries().await.unwrap();
        journal.truncate_through(entries[1].seq).await.unwrap();

        let rest = journal.entries().await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].seq, entries[2].seq);
    }

    #[tokio::test]
    async fn test_clear_empties() {
        let (_pool, journal) = journal().await;
        journal.append(&id("A1"), &JournalOp::Delete).await.unwrap();
        assert!(!journal.is_empty().await.unwrap());

        journal.clear().await.unwrap();
        assert!(journal.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_op_serde_shapes() {
        let op = JournalOp::SetMtime { mtime: Utc::now() };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op\":\"set_mtime\""));
        let back: JournalOp = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name(), "set_mtime");
    }
}
