//! Policy-driven conflict resolution.
//!
//! Inputs: the conflicted local record and the current remote item.
//! The resolver holds the item lock for the whole resolution so no
//! pipeline observes a half-applied outcome.
//!
//! Outcomes per policy:
//! - **keep-local**: adopt the remote etag (so the next upload's
//!   If-Match succeeds) and requeue the local bytes as dirty.
//! - **keep-remote**: fetch the remote bytes into the cache (hash
//!   verified, one retry on mismatch) and leave the item `Hydrated`
//!   on the remote version.
//! - **last-writer-wins**: compare mtimes and delegate to one of the
//!   above.
//! - **keep-both**: move the local bytes to a `(conflict <ts>)` copy
//!   (a new locally-created item queued for upload), then reconcile
//!   the remote into the original id as in keep-remote.
//! - **prompt**: leave the item in `Conflict` for a user-driven call.
//!
//! A successful resolution always exits to `Hydrated` or
//! `DirtyLocal`; a failed fetch (offline, persistent corruption)
//! leaves the item in `Conflict` for a later attempt.

use std::sync::Arc;

use chrono::Utc;

use nimbus_core::config::ConflictPolicy;
use nimbus_core::domain::newtypes::FileName;
use nimbus_core::ports::remote_drive::{RemoteDrive, RemoteItem};
use nimbus_core::quickxor;
use nimbus_core::{ItemId, ItemRecord, ItemState, NimbusError};
use nimbus_store::{ContentCache, ItemLocks, MetadataStore};

/// What a resolution did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local bytes won; the item is dirty and queued for upload.
    KeptLocal,
    /// Remote won; the local bytes were replaced by the remote
    /// content and the item is hydrated.
    KeptRemote,
    /// Both kept: the local bytes live on under `conflict_name`.
    KeptBoth {
        conflict_name: FileName,
        copy_id: ItemId,
    },
    /// Policy is `prompt`; the item stays in `Conflict`.
    Deferred,
}

/// Applies conflict policies to conflicted items.
pub struct ConflictResolver {
    store: Arc<MetadataStore>,
    content: Arc<ContentCache>,
    locks: Arc<ItemLocks>,
    drive: Arc<dyn RemoteDrive>,
}

impl ConflictResolver {
    /// Create a resolver over the shared stores and the drive (used
    /// to re-fetch content when the remote version wins).
    pub fn new(
        store: Arc<MetadataStore>,
        content: Arc<ContentCache>,
        locks: Arc<ItemLocks>,
        drive: Arc<dyn RemoteDrive>,
    ) -> Self {
        Self {
            store,
            content,
            locks,
            drive,
        }
    }

    /// Resolve the conflict on `id` against `remote` using `policy`.
    ///
    /// # Errors
    /// `NotFound` if the record vanished; `Domain` if the record is
    /// not in `Conflict`; network errors if the winning remote
    /// content could not be fetched (the item then stays in
    /// `Conflict`).
    pub async fn resolve(
        &self,
        id: &ItemId,
        remote: &RemoteItem,
        policy: ConflictPolicy,
    ) -> Result<Resolution, NimbusError> {
        let _guard = self.locks.lock(id).await;

        let mut record = self
            .store
            .get(id)
            .await
            .map_err(NimbusError::from)?
            .ok_or_else(|| NimbusError::NotFound(id.to_string()))?;

        if record.state != ItemState::Conflict {
            return Err(NimbusError::Domain(
                nimbus_core::domain::DomainError::InvalidTransition {
                    from: record.state.name(),
                    to: "resolved",
                },
            ));
        }

        let resolution = match policy {
            ConflictPolicy::Prompt => {
                tracing::info!(item = %id, "Conflict deferred to user resolution");
                return Ok(Resolution::Deferred);
            }
            ConflictPolicy::KeepLocal => {
                self.keep_local(&mut record, remote).await?;
                Resolution::KeptLocal
            }
            ConflictPolicy::KeepRemote => {
                self.keep_remote(&mut record, remote).await?;
                Resolution::KeptRemote
            }
            ConflictPolicy::LastWriterWins => {
                let remote_mtime = remote.modified.unwrap_or_else(Utc::now);
                if record.mtime > remote_mtime {
                    self.keep_local(&mut record, remote).await?;
                    Resolution::KeptLocal
                } else {
                    self.keep_remote(&mut record, remote).await?;
                    Resolution::KeptRemote
                }
            }
            ConflictPolicy::KeepBoth => {
                let (conflict_name, copy_id) = self.keep_both(&mut record, remote).await?;
                Resolution::KeptBoth {
                    conflict_name,
                    copy_id,
                }
            }
        };

        tracing::info!(item = %id, ?resolution, "Conflict resolved");
        Ok(resolution)
    }

    /// Local bytes win: take the remote's etag so the requeued upload
    /// passes its If-Match, and mark dirty.
    async fn keep_local(
        &self,
        record: &mut ItemRecord,
        remote: &RemoteItem,
    ) -> Result<(), NimbusError> {
        record.etag = remote.etag.clone();
        record.transition_to(ItemState::DirtyLocal)?;
        self.store.put(record).await.map_err(NimbusError::from)?;
        Ok(())
    }

    /// Remote wins: replace the local bytes with the remote content
    /// and leave the item hydrated on the remote version.
    async fn keep_remote(
        &self,
        record: &mut ItemRecord,
        remote: &RemoteItem,
    ) -> Result<(), NimbusError> {
        let size = if record.is_directory() {
            remote.size
        } else {
            self.fetch_remote_content(record, remote).await?
        };

        record.apply_remote_metadata(
            size,
            remote.modified.unwrap_or(record.mtime),
            remote.etag.clone(),
            remote.hash.clone(),
        );
        record.has_local_changes = false;
        record.last_error = None;
        record.transition_to(ItemState::Hydrated)?;
        self.store.put(record).await.map_err(NimbusError::from)?;
        Ok(())
    }

    /// Stream the remote bytes into a partial file, verify the
    /// declared hash (one retry on mismatch), and promote over the
    /// local content. Returns the downloaded length.
    async fn fetch_remote_content(
        &self,
        record: &ItemRecord,
        remote: &RemoteItem,
    ) -> Result<u64, NimbusError> {
        let mut last_err = None;
        for attempt in 0..2 {
            let partial = self
                .content
                .open_partial(&record.id)
                .map_err(NimbusError::from)?;
            let mut sink = tokio::fs::File::from_std(partial);
            let written = match self.drive.download(&record.id, &mut sink).await {
                Ok(written) => written,
                Err(e) => {
                    drop(sink);
                    self.content.discard_partial(&record.id);
                    return Err(e);
                }
            };
            drop(sink);

            if let Some(declared) = &remote.hash {
                let actual = quickxor::hash_file(&self.content.partial_path(&record.id))?;
                if actual != declared.as_str() {
                    tracing::warn!(item = %record.id, attempt, "Resolution fetch hash mismatch");
                    self.content.discard_partial(&record.id);
                    last_err = Some(NimbusError::Integrity(format!(
                        "hash mismatch for {}: expected {declared}, got {actual}",
                        record.id
                    )));
                    continue;
                }
            }

            self.content
                .promote_partial(&record.id)
                .map_err(NimbusError::from)?;
            return Ok(written);
        }
        Err(last_err
            .unwrap_or_else(|| NimbusError::Integrity("resolution fetch failed".to_string())))
    }

    /// Keep both: clone the local bytes into a new locally-created
    /// sibling, then reconcile the remote into the original id.
    async fn keep_both(
        &self,
        record: &mut ItemRecord,
        remote: &RemoteItem,
    ) -> Result<(FileName, ItemId), NimbusError> {
        // Pick a collision-free conflict-copy name.
        let parent_id = record.parent_id.clone();
        let mut taken = Vec::new();
        for child in self
            .store
            .children(&parent_id)
            .await
            .map_err(NimbusError::from)?
        {
            taken.push(child.name.collision_key());
        }
        let conflict_name =
            crate::namer::ConflictNamer::generate_unique(&record.name, Utc::now(), |candidate| {
                taken.contains(&candidate.collision_key())
            })?;

        // The copy is a new local item carrying the local bytes.
        let mut copy = ItemRecord::new_local(parent_id, conflict_name.clone(), record.kind);
        copy.size = record.size;
        copy.mtime = record.mtime;
        self.content
            .copy(&record.id, &copy.id)
            .map_err(NimbusError::from)?;
        self.store.put(&copy).await.map_err(NimbusError::from)?;

        // Original id takes the remote version.
        self.keep_remote(record, remote).await?;

        Ok((conflict_name, copy.id))
    }
}

// ============================================================================
// Tests
// ============================================================================
