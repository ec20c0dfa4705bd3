//! On-demand hydration pool.
//!
//! Moves items from `Ghost` to `Hydrated`: download into a partial
//! file, verify the quickXorHash, promote, flip the state. Bounded by
//! a worker semaphore and a queue cap; concurrent requests for the
//! same item coalesce onto one download, with waiters observing a
//! shared watch channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use nimbus_core::config::HydrationConfig;
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::quickxor;
use nimbus_core::{ItemId, ItemState, NimbusError};
use nimbus_store::{ContentCache, ItemLocks, MetadataStore};

use crate::stats::PipelineStatus;

/// Progress of one hydration, observed through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationPhase {
    /// Queued or downloading.
    Pending,
    /// Content verified and promoted; the item is `Hydrated`.
    Done,
    /// Hydration failed; the item is back to `Ghost`.
    Failed(String),
}

/// Bounded pool of hydration workers.
pub struct HydrationPool {
    drive: Arc<dyn RemoteDrive>,
    store: Arc<MetadataStore>,
    content: Arc<ContentCache>,
    locks: Arc<ItemLocks>,
    workers: Arc<Semaphore>,
    /// In-flight hydrations; waiters subscribe to the same channel.
    active: Arc<DashMap<ItemId, watch::Receiver<HydrationPhase>>>,
    queue_capacity: usize,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
    status: Arc<PipelineStatus>,
}

impl HydrationPool {
    /// Create a pool per the configuration.
    pub fn new(
        config: &HydrationConfig,
        drive: Arc<dyn RemoteDrive>,
        store: Arc<MetadataStore>,
        content: Arc<ContentCache>,
        locks: Arc<ItemLocks>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            drive,
            store,
            content,
            locks,
            workers: Arc::new(Semaphore::new(config.workers)),
            active: Arc::new(DashMap::new()),
            queue_capacity: config.queue_size,
            queued: Arc::new(AtomicUsize::new(0)),
            cancel,
            status: Arc::new(PipelineStatus::default()),
        }
    }

    /// Number of in-flight hydrations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Pipeline status for diagnostics.
    #[must_use]
    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// Request hydration of `id` (user-facing: waits for queue space
    /// implicitly, since coalescing bounds growth by distinct items).
    ///
    /// Returns a receiver observing the hydration's phase. If the item
    /// is already hydrating the existing download's receiver is
    /// returned.
    pub fn request(&self, id: &ItemId) -> Result<watch::Receiver<HydrationPhase>, NimbusError> {
        if let Some(existing) = self.active.get(id) {
            return Ok(existing.clone());
        }

        if self.queued.load(Ordering::Relaxed) >= self.queue_capacity {
            return Err(NimbusError::Transient("hydration queue full".to_string()));
        }

        let (tx, rx) = watch::channel(HydrationPhase::Pending);
        self.active.insert(id.clone(), rx.clone());
        self.queued.fetch_add(1, Ordering::Relaxed);

        let task = HydrationTask {
            id: id.clone(),
            drive: Arc::clone(&self.drive),
            store: Arc::clone(&self.store),
            content: Arc::clone(&self.content),
            locks: Arc::clone(&self.locks),
            workers: Arc::clone(&self.workers),
            cancel: self.cancel.clone(),
            status: Arc::clone(&self.status),
        };
        let active = Arc::clone(&self.active);
        let queued = Arc::clone(&self.queued);

        tokio::spawn(async move {
            let id = task.id.clone();
            let outcome = task.run().await;
            queued.fetch_sub(1, Ordering::Relaxed);
            active.remove(&id);
            match outcome {
                Ok(()) => {
                    let _ = tx.send(HydrationPhase::Done);
                }
                Err(e) => {
                    let _ = tx.send(HydrationPhase::Failed(e.to_string()));
                }
            }
        });

        Ok(rx)
    }

    /// Hydrate and wait for the outcome, bounded by `timeout`.
    /// This is the FUSE open path.
    pub async fn hydrate_and_wait(
        &self,
        id: &ItemId,
        timeout: std::time::Duration,
    ) -> Result<(), NimbusError> {
        let mut rx = self.request(id)?;

        let wait = async {
            loop {
                match rx.borrow().clone() {
                    HydrationPhase::Done => return Ok(()),
                    HydrationPhase::Failed(reason) => {
                        return Err(NimbusError::Io(std::io::Error::other(reason)));
                    }
                    HydrationPhase::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(NimbusError::Io(std::io::Error::other(
                        "hydration task vanished",
                    )));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(NimbusError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("hydration of {id} timed out"),
            ))),
        }
    }
}

/// One download, run on a worker permit.
struct HydrationTask {
    id: ItemId,
    drive: Arc<dyn RemoteDrive>,
    store: Arc<MetadataStore>,
    content: Arc<ContentCache>,
    locks: Arc<ItemLocks>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    status: Arc<PipelineStatus>,
}

impl HydrationTask {
    async fn run(&self) -> Result<(), NimbusError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| NimbusError::Io(std::io::Error::other("hydration pool closed")))?;

        if self.cancel.is_cancelled() {
            return Err(NimbusError::Io(std::io::Error::other("shutting down")));
        }

        // The lock is held across the download: the state-machine
        // contract makes the item exclusively ours while `Hydrating`.
        let _guard = self.locks.lock(&self.id).await;

        let mut record = self
            .store
            .get(&self.id)
            .await
            .map_err(NimbusError::from)?
            .ok_or_else(|| NimbusError::NotFound(self.id.to_string()))?;

        match record.state {
            ItemState::Ghost => {}
            // Someone hydrated it while we waited on the lock.
            ItemState::Hydrated | ItemState::DirtyLocal => return Ok(()),
            other => {
                return Err(NimbusError::Domain(
                    nimbus_core::domain::DomainError::InvalidTransition {
                        from: other.name(),
                        to: ItemState::Hydrating.name(),
                    },
                ))
            }
        }

        record.transition_to(ItemState::Hydrating)?;
        self.store.put(&record).await.map_err(NimbusError::from)?;

        // One verification retry on hash mismatch.
        let mut last_err = None;
        for attempt in 0..2 {
            match self.download_and_verify(&record).await {
                Ok(actual_size) => {
                    self.content.promote_partial(&self.id).map_err(NimbusError::from)?;
                    record.size = actual_size;
                    record.transition_to(ItemState::Hydrated)?;
                    record.last_error = None;
                    self.store.put(&record).await.map_err(NimbusError::from)?;
                    self.status.clear_error();
                    tracing::debug!(item = %self.id, size = actual_size, attempt, "Hydrated");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(item = %self.id, attempt, error = %e, "Hydration attempt failed");
                    self.content.discard_partial(&self.id);
                    let retry = matches!(e, NimbusError::Integrity(_)) && attempt == 0;
                    last_err = Some(e);
                    if !retry {
                        break;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| {
            NimbusError::Io(std::io::Error::other("hydration failed"))
        });
        record.transition_to(ItemState::Ghost)?;
        record.last_error = Some(err.to_string());
        self.store.put(&record).await.map_err(NimbusError::from)?;
        self.status.record_error(&err.to_string());
        Err(err)
    }

    /// Stream into the partial file and verify the declared hash.
    /// Returns the downloaded length.
    async fn download_and_verify(
        &self,
        record: &nimbus_core::ItemRecord,
    ) -> Result<u64, NimbusError> {
        let partial = self.content.open_partial(&self.id).map_err(NimbusError::from)?;
        let mut sink = tokio::fs::File::from_std(partial);
        let written = self.drive.download(&self.id, &mut sink).await?;
        drop(sink);

        if let Some(declared) = &record.content_hash {
            let actual = quickxor::hash_file(&self.content.partial_path(&self.id))?;
            if actual != declared.as_str() {
                return Err(NimbusError::Integrity(format!(
                    "hash mismatch for {}: expected {declared}, got {actual}",
                    self.id
                )));
            }
        }
        Ok(written)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use nimbus_core::domain::newtypes::{ContentHash, ETag, FileName};
    use nimbus_core::ports::remote_drive::{
        DeltaPage, DriveQuota, ItemPatch, RealtimeEndpoint, RemoteItem,
    };
    use nimbus_core::{ItemKind, ItemRecord};
    use nimbus_store::StorePool;
    use std::sync::atomic::AtomicU32;

    /// Drive stub serving fixed bytes per item, counting downloads.
    struct StubDrive {
        bytes: Vec<u8>,
        downloads: AtomicU32,
        /// Corrupt the first N downloads (wrong bytes).
        corrupt_first: AtomicU32,
    }

    impl StubDrive {
        fn new(bytes: &[u8]) -> Self {
            Self {
                bytes: bytes.to_vec(),
                downloads: AtomicU32::new(0),
                corrupt_first: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteDrive for StubDrive {
        async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, NimbusError> {
            Err(NimbusError::NotFound(id.to_string()))
        }
        async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, NimbusError> {
            Err(NimbusError::NotFound(path.to_string()))
        }
        async fn get_root(&self) -> Result<RemoteItem, NimbusError> {
            Err(NimbusError::NotFound("root".to_string()))
        }
        async fn list_children(
            &self,
            _id: &ItemId,
            _next: Option<&str>,
        ) -> Result<(Vec<RemoteItem>, Option<String>), NimbusError> {
            Ok((Vec::new(), None))
        }
        async fn download(
            &self,
            _id: &ItemId,
            sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        ) -> Result<u64, NimbusError> {
            use tokio::io::AsyncWriteExt;
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let corrupt = self
                .corrupt_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    if n > 0 {
                        Some(n - 1)
                    } else {
                        None
                    }
                })
                .is_ok();
            let payload = if corrupt {
                b"garbage!".to_vec()
            } else {
                self.bytes.clone()
            };
            sink.write_all(&payload).await?;
            sink.flush().await?;
            Ok(payload.len() as u64)
        }
        async fn patch_item(
            &self,
            _id: &ItemId,
            _patch: &ItemPatch,
            _if_match: Option<&ETag>,
        ) -> Result<RemoteItem, NimbusError> {
            unimplemented!()
        }
        async fn create_folder(
            &self,
            _parent_id: &ItemId,
            _name: &str,
        ) -> Result<RemoteItem, NimbusError> {
            unimplemented!()
        }
        async fn upload_small(
            &self,
            _parent_id: &ItemId,
            _item_id: Option<&ItemId>,
            _name: &str,
            _data: &[u8],
            _if_match: Option<&ETag>,
        ) -> Result<RemoteItem, NimbusError> {
            unimplemented!()
        }
        async fn upload_session(
            &self,
            _parent_id: &ItemId,
            _name: &str,
            _source: &std::path::Path,
            _if_match: Option<&ETag>,
        ) -> Result<RemoteItem, NimbusError> {
            unimplemented!()
        }
        async fn delta(
            &self,
            _cursor: Option<&nimbus_core::DeltaCursor>,
        ) -> Result<DeltaPage, NimbusError> {
            unimplemented!()
        }
        async fn delta_next(&self, _next_link: &str) -> Result<DeltaPage, NimbusError> {
            unimplemented!()
        }
        async fn remove(
            &self,
            _id: &ItemId,
            _if_match: Option<&ETag>,
        ) -> Result<(), NimbusError> {
            unimplemented!()
        }
        async fn subscribe(&self) -> Result<RealtimeEndpoint, NimbusError> {
            unimplemented!()
        }
        async fn quota(&self) -> Result<DriveQuota, NimbusError> {
            Ok(DriveQuota::default())
        }
    }

    struct Fixture {
        _pool: StorePool,
        _dir: tempfile::TempDir,
        store: Arc<MetadataStore>,
        content: Arc<ContentCache>,
        drive: Arc<StubDrive>,
        pool: HydrationPool,
    }

    async fn fixture(bytes: &[u8]) -> Fixture {
        let pool = StorePool::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::new(&pool));
        let content = Arc::new(ContentCache::new(dir.path()).unwrap());
        let locks = Arc::new(ItemLocks::new());
        let drive = Arc::new(StubDrive::new(bytes));
        let hydration = HydrationPool::new(
            &HydrationConfig::default(),
            drive.clone(),
            store.clone(),
            content.clone(),
            locks,
            CancellationToken::new(),
        );
        Fixture {
            _pool: pool,
            _dir: dir,
            store,
            content,
            drive,
            pool: hydration,
        }
    }

    fn id(s: &str) -> ItemId {
        ItemId::new(s.to_string()).unwrap()
    }

    async fn seed_ghost(fx: &Fixture, item: &str, bytes: &[u8], with_hash: bool) {
        let hash = if with_hash {
            Some(ContentHash::new(quickxor::hash_bytes(bytes)).unwrap())
        } else {
            None
        };
        let record = ItemRecord::from_remote(
            id(item),
            id("ROOT"),
            FileName::new(format!("{item}.bin")).unwrap(),
            ItemKind::File,
            bytes.len() as u64,
            Utc::now(),
            Some(ETag::new("\"v1\"".to_string()).unwrap()),
            hash,
        );
        fx.store.put(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_hydrates_ghost_to_hydrated() {
        let fx = fixture(b"hello").await;
        seed_ghost(&fx, "A1", b"hello", true).await;

        fx.pool
            .hydrate_and_wait(&id("A1"), std::time::Duration::from_secs(5))
            .await
            .unwrap();

        let record = fx.store.get(&id("A1")).await.unwrap().unwrap();
        assert_eq!(record.state, ItemState::Hydrated);
        assert_eq!(fx.content.read_at(&id("A1"), 0, 16).unwrap(), b"hello");
        assert!(!fx.content.partial_path(&id("A1")).exists());
    }

    #[tokio::test]
    async fn test_second_request_coalesces() {
        let fx = fixture(b"hello").await;
        seed_ghost(&fx, "A1", b"hello", true).await;

        let rx1 = fx.pool.request(&id("A1")).unwrap();
        let rx2 = fx.pool.request(&id("A1")).unwrap();
        // Both receivers watch the same channel.
        assert!(rx1.same_channel(&rx2));
    }

    #[tokio::test]
    async fn test_hydrated_item_is_not_redownloaded() {
        let fx = fixture(b"hello").await;
        seed_ghost(&fx, "A1", b"hello", true).await;

        fx.pool
            .hydrate_and_wait(&id("A1"), std::time::Duration::from_secs(5))
            .await
            .unwrap();
        fx.pool
            .hydrate_and_wait(&id("A1"), std::time::Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(fx.drive.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hash_mismatch_retries_once_then_succeeds() {
        let fx = fixture(b"hello").await;
        seed_ghost(&fx, "A1", b"hello", true).await;
        fx.drive.corrupt_first.store(1, Ordering::SeqCst);

        fx.pool
            .hydrate_and_wait(&id("A1"), std::time::Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(fx.drive.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(
            fx.store.get(&id("A1")).await.unwrap().unwrap().state,
            ItemState::Hydrated
        );
    }

    #[tokio::test]
    async fn test_persistent_hash_mismatch_fails_to_ghost() {
        let fx = fixture(b"hello").await;
        seed_ghost(&fx, "A1", b"hello", true).await;
        fx.drive.corrupt_first.store(10, Ordering::SeqCst);

        let err = fx
            .pool
            .hydrate_and_wait(&id("A1"), std::time::Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, NimbusError::Io(_)));

        let record = fx.store.get(&id("A1")).await.unwrap().unwrap();
        assert_eq!(record.state, ItemState::Ghost);
        assert!(record.last_error.is_some());
        assert!(!fx.content.exists(&id("A1")));
        // Exactly two attempts: the original and one retry.
        assert_eq!(fx.drive.downloads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_hash_skips_verification() {
        let fx = fixture(b"hello").await;
        seed_ghost(&fx, "A1", b"hello", false).await;

        fx.pool
            .hydrate_and_wait(&id("A1"), std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            fx.store.get(&id("A1")).await.unwrap().unwrap().state,
            ItemState::Hydrated
        );
    }
}
