//! Offline journal replay.
//!
//! Entries recorded while disconnected are pushed to the remote in
//! order once connectivity returns. Content writes need no explicit
//! replay (the records are still `DirtyLocal` and the upload manager
//! owns them); renames, deletions, and mtime changes are replayed
//! here. An entry whose item now conflicts with a newer remote
//! version routes through the conflict resolver.
//!
//! Each replayed entry is truncated from the journal individually, so
//! an interruption (offline again, shutdown) resumes exactly where it
//! stopped.

use std::sync::Arc;

use nimbus_conflict::ConflictResolver;
use nimbus_core::config::ConflictPolicy;
use nimbus_core::ports::remote_drive::{ItemPatch, RemoteDrive};
use nimbus_core::{ItemState, NimbusError};
use nimbus_store::{Journal, JournalEntry, JournalOp, MetadataStore};

/// Replays the offline journal.
pub struct JournalReplayer {
    journal: Arc<Journal>,
    store: Arc<MetadataStore>,
    drive: Arc<dyn RemoteDrive>,
    resolver: Arc<ConflictResolver>,
    policy: ConflictPolicy,
}

impl JournalReplayer {
    /// Create a replayer over the shared components.
    pub fn new(
        journal: Arc<Journal>,
        store: Arc<MetadataStore>,
        drive: Arc<dyn RemoteDrive>,
        resolver: Arc<ConflictResolver>,
        policy: ConflictPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            journal,
            store,
            drive,
            resolver,
            policy,
        })
    }

    /// Replay all pending entries in order. Stops (preserving the
    /// tail) if the network drops again mid-replay. Returns how many
    /// entries were replayed.
    pub async fn replay(&self) -> Result<u64, NimbusError> {
        let entries = self.journal.entries().await.map_err(NimbusError::from)?;
        let mut replayed = 0u64;

        for entry in entries {
            match self.replay_entry(&entry).await {
                Ok(()) => {
                    self.journal
                        .truncate_through(entry.seq)
                        .await
                        .map_err(NimbusError::from)?;
                    replayed += 1;
                }
                Err(e) if e.is_offline() => {
                    tracing::info!(
                        seq = entry.seq,
                        "Offline again mid-replay; keeping remaining entries"
                    );
                    return Err(e);
                }
                Err(e) => {
                    // A permanently unreplayable entry must not wedge
                    // the journal forever.
                    tracing::warn!(
                        seq = entry.seq,
                        item = %entry.item_id,
                        op = entry.op.name(),
                        error = %e,
                        "Dropping unreplayable journal entry"
                    );
                    self.journal
                        .truncate_through(entry.seq)
                        .await
                        .map_err(NimbusError::from)?;
                }
            }
        }
        Ok(replayed)
    }

    async fn replay_entry(&self, entry: &JournalEntry) -> Result<(), NimbusError> {
        match &entry.op {
            // The record is (still) DirtyLocal; the upload pipeline
            // pushes content and creations.
            JournalOp::Create { .. } | JournalOp::Write { .. } => Ok(()),

            JournalOp::Rename {
                new_parent_id,
                new_name,
            } => {
                let Some(record) = self
                    .store
                    .get(&entry.item_id)
                    .await
                    .map_err(NimbusError::from)?
                else {
                    return Ok(()); // deleted since
                };
                if record.id.is_local() {
                    // The creation upload will use the current name.
                    return Ok(());
                }

                let patch = ItemPatch {
                    name: Some(new_name.as_str().to_string()),
                    parent_id: if new_parent_id.is_local() {
                        None
                    } else {
                        Some(new_parent_id.clone())
                    },
                    mtime: None,
                };
                match self
                    .drive
                    .patch_item(&record.id, &patch, record.etag.as_ref())
                    .await
                {
                    Ok(updated) => {
                        let mut record = record;
                        record.etag = updated.etag;
                        self.store.put(&record).await.map_err(NimbusError::from)?;
                        Ok(())
                    }
                    Err(NimbusError::PreconditionFailed(_)) => {
                        self.conflict(&record.id).await
                    }
                    Err(NimbusError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            JournalOp::Delete => match self.drive.remove(&entry.item_id, None).await {
                Ok(()) | Err(NimbusError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            },

            JournalOp::SetMtime { mtime } => {
                let Some(record) = self
                    .store
                    .get(&entry.item_id)
                    .await
                    .map_err(NimbusError::from)?
                else {
                    return Ok(());
                };
                if record.id.is_local() {
                    return Ok(());
                }
                let patch = ItemPatch {
                    name: None,
                    parent_id: None,
                    mtime: Some(*mtime),
                };
                match self
                    .drive
                    .patch_item(&record.id, &patch, record.etag.as_ref())
                    .await
                {
                    Ok(_) | Err(NimbusError::NotFound(_)) => Ok(()),
                    // A timestamp is not worth a conflict; the delta
                    // loop will reconcile the metadata.
                    Err(NimbusError::PreconditionFailed(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Park the item in `Conflict` and run the configured policy.
    async fn conflict(&self, id: &nimbus_core::ItemId) -> Result<(), NimbusError> {
        let Some(mut record) = self.store.get(id).await.map_err(NimbusError::from)? else {
            return Ok(());
        };
        if record.state != ItemState::Conflict {
            if record.state.has_pending_upload() {
                record.transition_to(ItemState::Conflict)?;
                self.store.put(&record).await.map_err(NimbusError::from)?;
            } else {
                // No dirty bytes backing the rename: the remote version
                // won and the next delta cycle reconciles the metadata.
                tracing::warn!(item = %id, "Offline rename overtaken by remote edit");
                return Ok(());
            }
        }
        let remote = self.drive.get_item(id).await?;
        self.resolver.resolve(id, &remote, self.policy).await?;
        Ok(())
    }
}
