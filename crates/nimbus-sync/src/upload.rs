//! Upload manager.
//!
//! Watches for `DirtyLocal` items and pushes them to the remote:
//! small content in one PUT, large content through a resumable
//! session, locally-created directories via folder creation. At most
//! one upload runs per item; the If-Match header carries the
//! pre-upload etag so a concurrent remote edit surfaces as 412 and
//! routes through the conflict resolver.
//!
//! Failure handling per attempt:
//! - offline → the item stays dirty, scanning pauses briefly;
//! - transient → per-item exponential backoff (1 s → 60 s);
//! - 412 → `Conflict`, resolver invoked with the current remote item;
//! - other permanent errors → the item is parked with `last_error`
//!   set, surfaced as EIO on next access, and skipped until the next
//!   local write.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use nimbus_conflict::ConflictResolver;
use nimbus_core::backoff::Backoff;
use nimbus_core::config::ConflictPolicy;
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::quickxor;
use nimbus_core::{ETag, ItemId, ItemRecord, ItemState, NimbusError};
use nimbus_store::{ContentCache, ItemLocks, Journal, JournalOp, MetadataStore};

use crate::stats::PipelineStatus;

/// Threshold between single-PUT and session uploads (4 MiB).
pub const SMALL_UPLOAD_MAX: u64 = 4 * 1024 * 1024;

/// Idle delay between scans when nothing kicks the manager.
const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Extra pause after an offline detection.
const OFFLINE_PAUSE: Duration = Duration::from_secs(15);

/// Concurrent upload bound.
const MAX_CONCURRENT_UPLOADS: usize = 4;

/// The upload pipeline.
pub struct UploadManager {
    drive: Arc<dyn RemoteDrive>,
    store: Arc<MetadataStore>,
    content: Arc<ContentCache>,
    locks: Arc<ItemLocks>,
    journal: Arc<Journal>,
    resolver: Arc<ConflictResolver>,
    policy: ConflictPolicy,
    kick: Notify,
    /// Runtime handle: deletion tasks are queued from FUSE callback
    /// threads, which have no ambient runtime context.
    runtime: tokio::runtime::Handle,
    cancel: CancellationToken,
    workers: Arc<Semaphore>,
    /// Items with an upload task in flight.
    active: DashSet<ItemId>,
    /// Per-item retry schedule: (not-before, consecutive failures).
    retry_after: DashMap<ItemId, (Instant, u32)>,
    /// Items parked after a permanent failure.
    parked: DashMap<ItemId, String>,
    /// Observer for provisional-id adoption (the filesystem layer
    /// keeps its inode tables in step).
    adoption_hook: std::sync::RwLock<Option<AdoptionHook>>,
    /// Back-reference for spawning tasks from `&self`.
    self_ref: std::sync::RwLock<std::sync::Weak<UploadManager>>,
    status: Arc<PipelineStatus>,
}

/// Callback invoked as `(old_id, new_id)` after an id adoption.
pub type AdoptionHook = Box<dyn Fn(&ItemId, &ItemId) + Send + Sync>;

impl UploadManager {
    /// Create the manager; call [`UploadManager::start`] to spawn the
    /// scheduler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drive: Arc<dyn RemoteDrive>,
        store: Arc<MetadataStore>,
        content: Arc<ContentCache>,
        locks: Arc<ItemLocks>,
        journal: Arc<Journal>,
        resolver: Arc<ConflictResolver>,
        policy: ConflictPolicy,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            drive,
            store,
            content,
            locks,
            journal,
            resolver,
            policy,
            kick: Notify::new(),
            runtime: tokio::runtime::Handle::current(),
            cancel,
            workers: Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS)),
            active: DashSet::new(),
            retry_after: DashMap::new(),
            parked: DashMap::new(),
            adoption_hook: std::sync::RwLock::new(None),
            self_ref: std::sync::RwLock::new(std::sync::Weak::new()),
            status: Arc::new(PipelineStatus::default()),
        });
        *manager.self_ref.write().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&manager);
        manager
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    /// Register the adoption observer.
    pub fn set_adoption_hook(&self, hook: AdoptionHook) {
        *self
            .adoption_hook
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Spawn the scheduler loop.
    pub fn start(&self) {
        let Some(manager) = self.arc() else { return };
        tokio::spawn(async move {
            loop {
                let pause = manager.scan().await;
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = manager.kick.notified() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        });
    }

    /// Wake the scheduler (called after writes, releases, and journal
    /// replay).
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// A local write invalidates a parked state: the user produced new
    /// bytes, so the next upload attempt starts fresh.
    pub fn unpark(&self, id: &ItemId) {
        self.parked.remove(id);
        self.retry_after.remove(id);
    }

    /// Pipeline status for diagnostics.
    #[must_use]
    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// Items parked after permanent failures.
    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Items with active upload tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Block until every dirty item has flushed or `timeout` elapses.
    /// Returns true on a clean drain. Used at unmount.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let dirty = self
                .store
                .items_in_state(ItemState::DirtyLocal)
                .await
                .map(|v| v.into_iter().filter(|r| !self.parked.contains_key(&r.id)).count())
                .unwrap_or(0);
            let uploading = self
                .store
                .items_in_state(ItemState::Uploading)
                .await
                .map(|v| v.len())
                .unwrap_or(0);
            if dirty == 0 && uploading == 0 && self.active.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(dirty, uploading, "Upload flush timed out");
                return false;
            }
            self.kick();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Push a remote deletion; journals it when offline.
    pub fn queue_delete(&self, id: ItemId, etag: Option<ETag>) {
        if id.is_local() {
            // Never uploaded; nothing exists remotely.
            return;
        }
        let Some(manager) = self.arc() else { return };
        self.runtime.spawn(async move {
            match manager.drive.remove(&id, etag.as_ref()).await {
                Ok(()) | Err(NimbusError::NotFound(_)) => {
                    tracing::debug!(item = %id, "Remote deletion confirmed");
                    manager.status.clear_error();
                }
                Err(e) if e.is_offline() => {
                    tracing::info!(item = %id, "Offline, journaling deletion");
                    if let Err(e) = manager.journal.append(&id, &JournalOp::Delete).await {
                        tracing::error!(item = %id, error = %e, "Failed to journal deletion");
                    }
                }
                Err(NimbusError::PreconditionFailed(_)) => {
                    // The remote changed since we last saw it; the next
                    // delta brings the item back. Remote wins deletes.
                    tracing::warn!(item = %id, "Deletion refused by etag, remote version kept");
                }
                Err(e) => {
                    tracing::warn!(item = %id, error = %e, "Remote deletion failed");
                    manager.status.record_error(&e.to_string());
                }
            }
        });
    }

    /// One scan: spawn upload tasks for due items. Returns how long
    /// to sleep before the next scan.
    async fn scan(&self) -> Duration {
        let mut candidates: Vec<ItemRecord> = Vec::new();

        // Directories first: children cannot upload under a
        // provisional parent id.
        match self.store.locally_created_directories().await {
            Ok(dirs) => candidates.extend(dirs),
            Err(e) => tracing::error!(error = %e, "Directory scan failed"),
        }
        match self.store.items_in_state(ItemState::DirtyLocal).await {
            Ok(dirty) => candidates.extend(dirty),
            Err(e) => tracing::error!(error = %e, "Dirty scan failed"),
        }

        let now = Instant::now();
        for record in candidates {
            let id = record.id.clone();
            if self.parked.contains_key(&id) || self.active.contains(&id) {
                continue;
            }
            if let Some(entry) = self.retry_after.get(&id) {
                if entry.value().0 > now {
                    continue;
                }
            }
            if record.parent_id.is_local() {
                // Parent directory has not been created remotely yet;
                // its adoption rewrites our parent_id and the next scan
                // picks this item up.
                continue;
            }

            let Some(manager) = self.arc() else { break };
            self.active.insert(id.clone());
            tokio::spawn(async move {
                let Ok(_permit) = Arc::clone(&manager.workers).acquire_owned().await else {
                    manager.active.remove(&id);
                    return;
                };
                let outcome = manager.upload_one(&id).await;
                manager.active.remove(&id);
                if let Err(e) = outcome {
                    if e.is_offline() {
                        manager.note_offline(&id);
                    }
                }
            });
        }
        SCAN_INTERVAL
    }

    fn note_offline(&self, id: &ItemId) {
        self.retry_after
            .insert(id.clone(), (Instant::now() + OFFLINE_PAUSE, 0));
    }

    fn note_transient(&self, id: &ItemId) {
        let failures = self.retry_after.get(id).map(|e| e.value().1).unwrap_or(0) + 1;
        let delay = Backoff::network().delay_for(failures);
        self.retry_after
            .insert(id.clone(), (Instant::now() + delay, failures));
    }

    /// Upload a single item, holding its lock for the duration.
    async fn upload_one(&self, id: &ItemId) -> Result<(), NimbusError> {
        let guard = self.locks.lock(id).await;

        let Some(record) = self.store.get(id).await.map_err(NimbusError::from)? else {
            return Ok(());
        };

        if record.is_directory() {
            let result = self.create_directory(&record).await;
            drop(guard);
            return self.settle(id, result).await;
        }

        if record.state != ItemState::DirtyLocal {
            return Ok(());
        }

        let result = self.upload_file(record).await;
        drop(guard);
        self.settle(id, result).await
    }

    /// Route an attempt outcome into retry bookkeeping or the
    /// conflict path. Runs without the item lock held (the resolver
    /// takes it itself).
    async fn settle(
        &self,
        id: &ItemId,
        result: Result<AttemptOutcome, NimbusError>,
    ) -> Result<(), NimbusError> {
        match result {
            Ok(AttemptOutcome::Done) => {
                self.retry_after.remove(id);
                self.status.clear_error();
                Ok(())
            }
            Ok(AttemptOutcome::Requeued) => {
                self.kick();
                Ok(())
            }
            Ok(AttemptOutcome::Conflicted) => {
                // State is already `Conflict`; hand it to the resolver
                // with the current remote version.
                match self.drive.get_item(id).await {
                    Ok(remote) => {
                        self.resolver.resolve(id, &remote, self.policy).await?;
                        self.kick();
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(item = %id, error = %e, "Conflict fetch failed; resolution deferred");
                        Err(e)
                    }
                }
            }
            Err(e) if e.is_offline() => {
                tracing::info!(item = %id, "Upload deferred: offline");
                Err(e)
            }
            Err(e) if e.is_transient() || matches!(e, NimbusError::AuthExpired) => {
                self.note_transient(id);
                self.status.record_error(&e.to_string());
                Err(e)
            }
            Err(e) => {
                tracing::error!(item = %id, error = %e, "Upload failed permanently, parking item");
                self.parked.insert(id.clone(), e.to_string());
                let _ = self.store.set_error(id, Some(&e.to_string())).await;
                self.status.record_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// Create a locally-created directory remotely and adopt its id.
    async fn create_directory(&self, record: &ItemRecord) -> Result<AttemptOutcome, NimbusError> {
        if !record.id.is_local() || !record.has_local_changes {
            return Ok(AttemptOutcome::Done);
        }

        let created = match self
            .drive
            .create_folder(&record.parent_id, record.name.as_str())
            .await
        {
            Ok(created) => created,
            Err(NimbusError::AlreadyExists(_)) => {
                // The folder exists remotely (raced with another
                // client or a replay); find and adopt its id.
                self.find_remote_sibling(record).await?.ok_or_else(|| {
                    NimbusError::AlreadyExists(format!(
                        "folder {} exists remotely but was not found in listing",
                        record.name
                    ))
                })?
            }
            Err(e) => return Err(e),
        };

        self.adopt(record, &created).await?;
        self.store
            .set_state(&created.id, ItemState::Hydrated, false)
            .await
            .map_err(NimbusError::from)?;
        tracing::info!(dir = %record.name, id = %created.id, "Directory created remotely");
        Ok(AttemptOutcome::Done)
    }

    async fn find_remote_sibling(
        &self,
        record: &ItemRecord,
    ) -> Result<Option<nimbus_core::ports::remote_drive::RemoteItem>, NimbusError> {
        let mut next: Option<String> = None;
        loop {
            let (items, link) = self
                .drive
                .list_children(&record.parent_id, next.as_deref())
                .await?;
            if let Some(found) = items
                .into_iter()
                .find(|i| record.name.eq_ignore_case(&i.name))
            {
                return Ok(Some(found));
            }
            match link {
                Some(link) => next = Some(link),
                None => return Ok(None),
            }
        }
    }

    /// Upload a file's content. Called with the item lock held and
    /// the record in `DirtyLocal`.
    async fn upload_file(&self, mut record: ItemRecord) -> Result<AttemptOutcome, NimbusError> {
        let id = record.id.clone();
        let path = self.content.content_path(&id);
        let snapshot_size = self
            .content
            .size_on_disk(&id)
            .map_err(NimbusError::from)?
            .ok_or_else(|| {
                NimbusError::Corruption(format!("dirty item {id} has no backing file"))
            })?;
        // Hash before and after the transfer: a write that lands while
        // the upload is in flight leaves the item dirty for another
        // round.
        let hash_before = quickxor::hash_file(&path)?;

        record.transition_to(ItemState::Uploading)?;
        record.size = snapshot_size;
        self.store.put(&record).await.map_err(NimbusError::from)?;

        let is_new = id.is_local();
        let if_match = if is_new { None } else { record.etag.clone() };

        let uploaded = if snapshot_size <= SMALL_UPLOAD_MAX {
            let bytes = self
                .content
                .read_at(&id, 0, snapshot_size as u32)
                .map_err(NimbusError::from)?;
            self.drive
                .upload_small(
                    &record.parent_id,
                    (!is_new).then_some(&id),
                    record.name.as_str(),
                    &bytes,
                    if_match.as_ref(),
                )
                .await
        } else {
            self.drive
                .upload_session(
                    &record.parent_id,
                    record.name.as_str(),
                    &path,
                    if_match.as_ref(),
                )
                .await
        };

        let uploaded = match uploaded {
            Ok(uploaded) => uploaded,
            Err(NimbusError::PreconditionFailed(detail)) => {
                record.transition_to(ItemState::Conflict)?;
                self.store.put(&record).await.map_err(NimbusError::from)?;
                tracing::warn!(item = %id, detail = %detail, "Upload rejected by etag, conflict");
                return Ok(AttemptOutcome::Conflicted);
            }
            Err(e) => {
                // Any other failure regresses to dirty; `settle`
                // decides between backoff and parking.
                record.transition_to(ItemState::DirtyLocal)?;
                self.store.put(&record).await.map_err(NimbusError::from)?;
                return Err(e);
            }
        };

        if is_new {
            self.adopt(&record, &uploaded).await?;
            record.id = uploaded.id.clone();
        }

        let hash_after = quickxor::hash_file(&self.content.content_path(&record.id))?;
        record.etag = uploaded.etag.clone();
        record.content_hash = uploaded.hash.clone();
        if hash_after == hash_before {
            record.transition_to(ItemState::Hydrated)?;
        } else {
            tracing::debug!(item = %record.id, "Content changed during upload, requeueing");
            record.transition_to(ItemState::DirtyLocal)?;
        }
        record.last_error = None;
        self.store.put(&record).await.map_err(NimbusError::from)?;

        tracing::info!(
            item = %record.id,
            bytes = snapshot_size,
            etag = uploaded.etag.as_ref().map(|e| e.as_str()).unwrap_or("-"),
            "Upload complete"
        );
        Ok(if record.state == ItemState::Hydrated {
            AttemptOutcome::Done
        } else {
            AttemptOutcome::Requeued
        })
    }

    /// Rewrite a provisional id everywhere after the server assigned
    /// the real one.
    async fn adopt(
        &self,
        record: &ItemRecord,
        uploaded: &nimbus_core::ports::remote_drive::RemoteItem,
    ) -> Result<(), NimbusError> {
        self.store
            .adopt_id(
                &record.id,
                &uploaded.id,
                uploaded.etag.as_ref(),
                uploaded.hash.as_ref(),
            )
            .await
            .map_err(NimbusError::from)?;
        self.content
            .rekey(&record.id, &uploaded.id)
            .map_err(NimbusError::from)?;
        self.locks.rekey(&record.id, uploaded.id.clone());
        if let Some(hook) = self
            .adoption_hook
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            hook(&record.id, &uploaded.id);
        }
        Ok(())
    }
}

/// Outcome of a single upload attempt.
enum AttemptOutcome {
    /// The item is clean (`Hydrated`).
    Done,
    /// The item picked up new writes mid-upload and stays dirty.
    Requeued,
    /// 412: the item is in `Conflict` awaiting resolution.
    Conflicted,
}
