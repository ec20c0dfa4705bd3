//! Engine wiring and lifecycle.
//!
//! [`SyncEngine`] owns every pipeline plus the shared stores, exposes
//! them to the filesystem layer, and implements the startup sequence
//! (open stores, crash recovery, spawn pipelines, connect realtime)
//! and the drain-then-stop shutdown (flush uploads with a bounded
//! wait, cancel pipelines, checkpoint, close).

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use nimbus_conflict::ConflictResolver;
use nimbus_core::config::Config;
use nimbus_core::context::NimbusContext;
use nimbus_core::ports::realtime_link::RealtimeLink;
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::{ItemId, ItemState, NimbusError};
use nimbus_graph::upload::{PersistedSession, SessionPersistence};
use nimbus_store::metadata::UploadSessionState;
use nimbus_store::{ContentCache, ItemLocks, Journal, MetadataStore, StorePool};

use crate::apply::RemoteApplier;
use crate::delta::DeltaLoop;
use crate::hydration::HydrationPool;
use crate::metadata_queue::MetadataQueue;
use crate::replay::JournalReplayer;
use crate::stats::SyncStats;
use crate::upload::UploadManager;

/// Database file name inside the per-mount cache directory.
const METADATA_DB: &str = "metadata.db";

/// The assembled engine.
pub struct SyncEngine {
    config: Config,
    context: Arc<NimbusContext>,
    cache_dir: std::path::PathBuf,
    pool: StorePool,
    store: Arc<MetadataStore>,
    content: Arc<ContentCache>,
    journal: Arc<Journal>,
    locks: Arc<ItemLocks>,
    drive: Arc<dyn RemoteDrive>,
    resolver: Arc<ConflictResolver>,
    hydration: Arc<HydrationPool>,
    metadata_queue: Arc<MetadataQueue>,
    upload: Arc<UploadManager>,
    delta: Arc<DeltaLoop>,
    replayer: Arc<JournalReplayer>,
    realtime: Option<Arc<dyn RealtimeLink>>,
    offline: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Open the per-mount store pool (shared with the caller, e.g.
    /// for the Graph client's upload-session persistence).
    pub async fn open_pool(cache_dir: &Path) -> Result<StorePool, NimbusError> {
        StorePool::open(&cache_dir.join(METADATA_DB))
            .await
            .map_err(NimbusError::from)
    }

    /// Recover from any previous crash, spawn the pipelines, and (if
    /// configured) connect the realtime link. `pool` comes from
    /// [`SyncEngine::open_pool`].
    pub async fn start(
        config: Config,
        context: Arc<NimbusContext>,
        drive: Arc<dyn RemoteDrive>,
        realtime: Option<Arc<dyn RealtimeLink>>,
        pool: StorePool,
        cache_dir: &Path,
    ) -> Result<Arc<Self>, NimbusError> {
        let store = Arc::new(MetadataStore::new(&pool));
        let content = Arc::new(ContentCache::new(cache_dir).map_err(NimbusError::from)?);

        // Crash recovery before anything runs: stale transfer states
        // regress, half-written downloads are swept.
        let regressed = store.recover_from_crash().await.map_err(NimbusError::from)?;
        let swept = content.sweep_partials().map_err(NimbusError::from)?;
        if regressed > 0 || swept > 0 {
            tracing::info!(regressed, swept, "Crash recovery completed");
        }

        let journal = Arc::new(Journal::new(&pool));
        let locks = Arc::new(ItemLocks::new());
        let resolver = Arc::new(ConflictResolver::new(
            store.clone(),
            content.clone(),
            locks.clone(),
            drive.clone(),
        ));
        let applier = Arc::new(RemoteApplier::new(
            store.clone(),
            content.clone(),
            locks.clone(),
            resolver.clone(),
            config.conflict_policy,
        ));

        let cancel = CancellationToken::new();
        let offline = Arc::new(AtomicBool::new(context.operational_offline()));

        let hydration = Arc::new(HydrationPool::new(
            &config.hydration,
            drive.clone(),
            store.clone(),
            content.clone(),
            locks.clone(),
            cancel.clone(),
        ));

        let metadata_queue = MetadataQueue::new(
            &config.metadata_queue,
            drive.clone(),
            store.clone(),
            content.clone(),
            applier.clone(),
            cancel.clone(),
        );
        metadata_queue.start(config.metadata_queue.workers);

        let upload = UploadManager::new(
            drive.clone(),
            store.clone(),
            content.clone(),
            locks.clone(),
            journal.clone(),
            resolver.clone(),
            config.conflict_policy,
            cancel.clone(),
        );
        upload.start();

        let replayer = JournalReplayer::new(
            journal.clone(),
            store.clone(),
            drive.clone(),
            resolver.clone(),
            config.conflict_policy,
        );

        let delta = DeltaLoop::new(
            drive.clone(),
            store.clone(),
            applier,
            realtime.clone(),
            Duration::from_secs(config.realtime.fallback_interval_seconds),
            replayer.clone(),
            upload.clone(),
            offline.clone(),
            cancel.clone(),
        );
        delta.start();

        if let Some(link) = &realtime {
            match link.connect().await {
                Ok(()) => tracing::info!("Realtime link established"),
                // The delta loop polls regardless; realtime is an
                // optimization, not a requirement.
                Err(e) => tracing::warn!(error = %e, "Realtime connect failed; polling only"),
            }
        }

        // Periodic WAL checkpoint between the startup one and the
        // shutdown one.
        {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(300));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            if let Err(e) = pool.checkpoint_passive().await {
                                tracing::warn!(error = %e, "Periodic checkpoint failed");
                            }
                        }
                    }
                }
            });
        }

        Ok(Arc::new(Self {
            config,
            context,
            cache_dir: cache_dir.to_path_buf(),
            pool,
            store,
            content,
            journal,
            locks,
            drive,
            resolver,
            hydration,
            metadata_queue,
            upload,
            delta,
            replayer,
            realtime,
            offline,
            cancel,
        }))
    }

    // ------------------------------------------------------------------
    // Component access (used by the filesystem layer)
    // ------------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<NimbusContext> {
        &self.context
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn content(&self) -> &Arc<ContentCache> {
        &self.content
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn locks(&self) -> &Arc<ItemLocks> {
        &self.locks
    }

    pub fn drive(&self) -> &Arc<dyn RemoteDrive> {
        &self.drive
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn hydration(&self) -> &Arc<HydrationPool> {
        &self.hydration
    }

    pub fn metadata_queue(&self) -> &Arc<MetadataQueue> {
        &self.metadata_queue
    }

    pub fn upload(&self) -> &Arc<UploadManager> {
        &self.upload
    }

    /// The journal replayer. The filesystem layer journals metadata
    /// operations and, when online, replays them eagerly; while
    /// offline the delta loop replays on reconnection.
    pub fn replayer(&self) -> &Arc<JournalReplayer> {
        &self.replayer
    }

    /// True while pipelines consider the drive unreachable (heuristic
    /// or operational).
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst) || self.context.operational_offline()
    }

    // ------------------------------------------------------------------
    // Root resolution
    // ------------------------------------------------------------------

    /// The drive root id: from the store if known, otherwise fetched
    /// (and persisted) from the remote.
    pub async fn ensure_root(&self) -> Result<ItemId, NimbusError> {
        if let Some(root) = self.store.root_id().await.map_err(NimbusError::from)? {
            return Ok(root);
        }
        let remote = self.drive.get_root().await?;
        self.store
            .set_root_id(&remote.id)
            .await
            .map_err(NimbusError::from)?;
        Ok(remote.id)
    }

    // ------------------------------------------------------------------
    // Cache eviction
    // ------------------------------------------------------------------

    /// Enforce the configured cache size limit: evict clean hydrated
    /// items, oldest access first, never touching `protected` ids
    /// (open handles) or anything dirty. Returns evicted ids.
    pub async fn enforce_cache_limit(
        &self,
        protected: &HashSet<ItemId>,
    ) -> Result<Vec<ItemId>, NimbusError> {
        let limit = self.config.cache.max_size_mib * 1024 * 1024;
        if limit == 0 || self.content.total_bytes() <= limit {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for record in self
            .store
            .items_in_state(ItemState::Hydrated)
            .await
            .map_err(NimbusError::from)?
        {
            if record.has_local_changes || protected.contains(&record.id) {
                continue;
            }
            candidates.push(record.id);
        }

        let evicted = self
            .content
            .evict_until(limit, &candidates)
            .map_err(NimbusError::from)?;

        // Evicted items are ghosts now.
        for id in &evicted {
            let _guard = self.locks.lock(id).await;
            if let Some(mut record) = self.store.get(id).await.map_err(NimbusError::from)? {
                if record.state == ItemState::Hydrated {
                    record.transition_to(ItemState::Ghost)?;
                    self.store.put(&record).await.map_err(NimbusError::from)?;
                }
            }
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "Evicted clean content to honor cache limit");
        }
        Ok(evicted)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Snapshot the engine's health.
    pub async fn stats(&self) -> SyncStats {
        let (high, low) = self.metadata_queue.depths().await;
        let upload_pending = self
            .store
            .items_in_state(ItemState::DirtyLocal)
            .await
            .map(|v| v.len())
            .unwrap_or(0)
            + self.upload.active_count();

        let mut last_errors = std::collections::BTreeMap::new();
        for (name, status) in [
            ("hydration", self.hydration.status()),
            ("metadata", self.metadata_queue.status()),
            ("upload", self.upload.status()),
            ("delta", self.delta.status()),
        ] {
            if let Some(error) = status.last_error() {
                last_errors.insert(name.to_string(), error);
            }
        }

        SyncStats {
            hydration_active: self.hydration.active_count(),
            upload_pending,
            upload_parked: self.upload.parked_count(),
            metadata_high_depth: high,
            metadata_low_depth: low,
            journal_entries: self.journal.len().await.unwrap_or(0),
            cache_bytes: self.content.total_bytes(),
            item_count: self.store.count().await.unwrap_or(0),
            realtime_health: self
                .realtime
                .as_ref()
                .map(|r| r.health().name().to_string())
                .unwrap_or_else(|| "disabled".to_string()),
            offline: self.is_offline(),
            last_errors,
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Drain-then-stop: flush pending uploads within `drain`, stop the
    /// pipelines, close the realtime link, checkpoint and close the
    /// store.
    pub async fn shutdown(&self, drain: Duration) {
        tracing::info!("Engine shutting down");

        let clean = self.upload.flush(drain).await;
        if !clean {
            tracing::warn!("Shutdown with unflushed local changes; they remain journal-safe in the store");
        }

        self.cancel.cancel();
        if let Some(link) = &self.realtime {
            link.shutdown().await;
        }

        if let Err(e) = self.pool.checkpoint().await {
            tracing::warn!(error = %e, "Final checkpoint failed");
        }
        let snapshot = self.cache_dir.join("metadata.snapshot.db");
        if let Err(e) = self.pool.snapshot_to(&snapshot).await {
            tracing::warn!(error = %e, "Shutdown snapshot failed");
        }
        self.pool.close().await;
        tracing::info!("Engine stopped");
    }
}

// ============================================================================
// Upload-session persistence over the metadata store
// ============================================================================

/// Adapter giving the Graph client durable upload-session state in
/// the metadata store.
pub struct StoreSessionPersistence {
    store: Arc<MetadataStore>,
}

impl StoreSessionPersistence {
    /// Wrap a metadata store.
    pub fn new(store: Arc<MetadataStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl SessionPersistence for StoreSessionPersistence {
    async fn load(&self, parent_id: &ItemId, name: &str) -> Option<PersistedSession> {
        match self.store.load_upload_session(parent_id, name).await {
            Ok(Some(state)) => Some(PersistedSession {
                upload_url: state.upload_url,
                total_size: state.total_size,
                bytes_confirmed: state.bytes_confirmed,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Upload session load failed");
                None
            }
        }
    }

    async fn save(&self, parent_id: &ItemId, name: &str, session: &PersistedSession) {
        let state = UploadSessionState {
            upload_url: session.upload_url.clone(),
            total_size: session.total_size,
            bytes_confirmed: session.bytes_confirmed,
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.save_upload_session(parent_id, name, &state).await {
            // Losing resume state only costs a restart of the upload.
            tracing::warn!(error = %e, "Upload session save failed");
        }
    }

    async fn clear(&self, parent_id: &ItemId, name: &str) {
        if let Err(e) = self.store.clear_upload_session(parent_id, name).await {
            tracing::warn!(error = %e, "Upload session clear failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_persistence_roundtrip() {
        let pool = StorePool::in_memory().await.unwrap();
        let store = Arc::new(MetadataStore::new(&pool));
        let sessions = StoreSessionPersistence::new(store);

        let parent = ItemId::new("ROOT".to_string()).unwrap();
        let session = PersistedSession {
            upload_url: "https://up.example/s".to_string(),
            total_size: 100,
            bytes_confirmed: 40,
        };
        sessions.save(&parent, "big.bin", &session).await;
        assert_eq!(sessions.load(&parent, "big.bin").await, Some(session));

        sessions.clear(&parent, "big.bin").await;
        assert!(sessions.load(&parent, "big.bin").await.is_none());
    }
}
