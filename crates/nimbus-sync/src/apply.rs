//! Applying remote item state to the local store.
//!
//! Shared by the delta loop and the metadata queue: given a
//! [`RemoteItem`], reconcile the corresponding record. The delta loop
//! runs with conflict detection on; the metadata queue leaves dirty
//! items alone entirely (conflicts belong to the delta path).
//!
//! Lock discipline: the quick store mutation happens under the item
//! lock; when a conflict is detected the lock is released first and
//! the resolver (which takes the lock itself) runs after.

use std::sync::Arc;

use nimbus_conflict::{ConflictResolver, Resolution};
use nimbus_core::config::ConflictPolicy;
use nimbus_core::domain::newtypes::FileName;
use nimbus_core::ports::remote_drive::RemoteItem;
use nimbus_core::{ItemRecord, ItemState, NimbusError};
use nimbus_store::{ContentCache, ItemLocks, MetadataStore};

/// What applying one remote item did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new record was created (as a `Ghost`).
    Created,
    /// An existing record took the remote metadata.
    Updated,
    /// Nothing to do (etag unchanged, or dirty item skipped).
    Skipped,
    /// The record (and any content) was removed.
    Deleted,
    /// Local changes met a newer remote version.
    Conflict(Resolution),
}

/// Reconciles remote items into the store.
pub struct RemoteApplier {
    store: Arc<MetadataStore>,
    content: Arc<ContentCache>,
    locks: Arc<ItemLocks>,
    resolver: Arc<ConflictResolver>,
    policy: ConflictPolicy,
}

impl RemoteApplier {
    /// Create an applier with the configured conflict policy.
    pub fn new(
        store: Arc<MetadataStore>,
        content: Arc<ContentCache>,
        locks: Arc<ItemLocks>,
        resolver: Arc<ConflictResolver>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            store,
            content,
            locks,
            resolver,
            policy,
        }
    }

    /// Apply one remote item. `detect_conflicts` is true on the delta
    /// path; the metadata path skips dirty items instead.
    pub async fn apply(
        &self,
        remote: &RemoteItem,
        detect_conflicts: bool,
    ) -> Result<ApplyOutcome, NimbusError> {
        if remote.is_root {
            self.store
                .set_root_id(&remote.id)
                .await
                .map_err(NimbusError::from)?;
            return Ok(ApplyOutcome::Skipped);
        }

        if remote.is_deleted {
            return self.apply_deletion(remote, detect_conflicts).await;
        }
        self.apply_upsert(remote, detect_conflicts).await
    }

    async fn apply_deletion(
        &self,
        remote: &RemoteItem,
        detect_conflicts: bool,
    ) -> Result<ApplyOutcome, NimbusError> {
        let guard = self.locks.lock(&remote.id).await;

        let Some(mut record) = self.store.get(&remote.id).await.map_err(NimbusError::from)?
        else {
            return Ok(ApplyOutcome::Skipped);
        };

        if record.has_local_changes {
            if !detect_conflicts {
                return Ok(ApplyOutcome::Skipped);
            }
            // The remote deleted an item we changed locally: park it
            // in Conflict. keep-local resurrects it on resolution;
            // there is no remote version to hand to the resolver, so
            // the policy decision is left to the user-driven path.
            if record.state != ItemState::Conflict {
                record.transition_to(ItemState::Conflict)?;
                self.store.put(&record).await.map_err(NimbusError::from)?;
            }
            tracing::warn!(item = %remote.id, "Remote deletion of locally-changed item");
            drop(guard);
            return Ok(ApplyOutcome::Conflict(Resolution::Deferred));
        }

        if record.is_directory() {
            self.store
                .delete_recursive(&record.id)
                .await
                .map_err(NimbusError::from)?;
        } else {
            self.store.delete(&record.id).await.map_err(NimbusError::from)?;
        }
        self.content.remove(&record.id).map_err(NimbusError::from)?;
        tracing::debug!(item = %remote.id, "Applied remote deletion");
        Ok(ApplyOutcome::Deleted)
    }

    async fn apply_upsert(
        &self,
        remote: &RemoteItem,
        detect_conflicts: bool,
    ) -> Result<ApplyOutcome, NimbusError> {
        let Some(parent_id) = remote.parent_id.clone() else {
            // Items without a parent reference (special folders we
            // never listed) are not part of the mounted namespace.
            return Ok(ApplyOutcome::Skipped);
        };
        let name = match FileName::new(remote.name.clone()) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(item = %remote.id, error = %e, "Skipping remote item with unusable name");
                return Ok(ApplyOutcome::Skipped);
            }
        };

        let needs_resolution = {
            let _guard = self.locks.lock(&remote.id).await;

            let existing = self.store.get(&remote.id).await.map_err(NimbusError::from)?;
            match existing {
                None => {
                    let record = ItemRecord::from_remote(
                        remote.id.clone(),
                        parent_id,
                        name,
                        if remote.is_directory {
                            nimbus_core::ItemKind::Directory
                        } else {
                            nimbus_core::ItemKind::File
                        },
                        remote.size,
                        remote.modified.unwrap_or_else(chrono::Utc::now),
                        remote.etag.clone(),
                        remote.hash.clone(),
                    );
                    match self.store.put(&record).await {
                        Ok(()) => return Ok(ApplyOutcome::Created),
                        Err(nimbus_store::StoreError::NameConflict(_)) => {
                            // A locally-created item occupies the name;
                            // its upload will reconcile ids.
                            tracing::debug!(item = %remote.id, "Name held locally, deferring");
                            return Ok(ApplyOutcome::Skipped);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(mut record) => {
                    if record.etag == remote.etag {
                        // Idempotence: repeated delta entries for the
                        // same version change nothing.
                        return Ok(ApplyOutcome::Skipped);
                    }

                    if record.has_local_changes {
                        if !detect_conflicts {
                            return Ok(ApplyOutcome::Skipped);
                        }
                        if record.state != ItemState::Conflict {
                            record.transition_to(ItemState::Conflict)?;
                            self.store.put(&record).await.map_err(NimbusError::from)?;
                        }
                        true // resolve below, outside the lock
                    } else {
                        self.update_clean(&mut record, remote, parent_id, name).await?;
                        return Ok(ApplyOutcome::Updated);
                    }
                }
            }
        };

        if needs_resolution {
            let resolution = self
                .resolver
                .resolve(&remote.id, remote, self.policy)
                .await?;
            return Ok(ApplyOutcome::Conflict(resolution));
        }
        Ok(ApplyOutcome::Skipped)
    }

    /// Take the remote version on a clean record: metadata, possible
    /// rename/move, and content invalidation when our cached bytes are
    /// for the old version.
    async fn update_clean(
        &self,
        record: &mut ItemRecord,
        remote: &RemoteItem,
        parent_id: nimbus_core::ItemId,
        name: FileName,
    ) -> Result<(), NimbusError> {
        record.apply_remote_metadata(
            remote.size,
            remote.modified.unwrap_or(record.mtime),
            remote.etag.clone(),
            remote.hash.clone(),
        );
        record.parent_id = parent_id;
        record.name = name;

        if record.state == ItemState::Hydrated {
            // Cached content belongs to the previous version.
            record.transition_to(ItemState::Ghost)?;
            self.content.remove(&record.id).map_err(NimbusError::from)?;
        }

        match self.store.put(record).await {
            Ok(()) => Ok(()),
            Err(nimbus_store::StoreError::NameConflict(name)) => {
                // Out-of-order rename pair in the same delta batch;
                // the later entry for the other item will settle it.
                tracing::warn!(item = %record.id, %name, "Deferred rename collision");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
