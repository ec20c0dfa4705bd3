//! Two-priority metadata fetch queue.
//!
//! High priority serves user-facing getattr/readdir misses; low
//! priority is speculative prefetch. Workers drain high before low.
//! The high queue applies backpressure to producers (they wait for
//! space); the low queue sheds load by dropping its oldest entry.
//! Requests for an id already queued or in flight are deduplicated.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use nimbus_core::config::MetadataQueueConfig;
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::{ItemId, NimbusError};
use nimbus_store::{ContentCache, MetadataStore};

use crate::apply::RemoteApplier;
use crate::stats::PipelineStatus;

/// A metadata fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataRequest {
    /// Refresh one item's record.
    Item(ItemId),
    /// Refresh a directory's children.
    Children(ItemId),
}

/// Request priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// User-facing (getattr/readdir): producers wait for space.
    High,
    /// Speculative prefetch: overflow drops the oldest entry.
    Low,
}

/// The queue plus its worker pool.
pub struct MetadataQueue {
    high: Mutex<VecDeque<MetadataRequest>>,
    low: Mutex<VecDeque<MetadataRequest>>,
    high_capacity: usize,
    low_capacity: usize,
    /// Wakes workers when work arrives.
    work: Notify,
    /// Wakes high-priority producers when space frees up.
    space: Notify,
    /// Queued or in-flight requests, for dedup.
    pending: DashSet<MetadataRequest>,
    drive: Arc<dyn RemoteDrive>,
    store: Arc<MetadataStore>,
    content: Arc<ContentCache>,
    applier: Arc<RemoteApplier>,
    cancel: CancellationToken,
    /// Back-reference for spawning workers from `&self`.
    self_ref: std::sync::RwLock<std::sync::Weak<MetadataQueue>>,
    status: Arc<PipelineStatus>,
}

impl MetadataQueue {
    /// Create the queue; call [`MetadataQueue::start`] to spawn the
    /// workers.
    pub fn new(
        config: &MetadataQueueConfig,
        drive: Arc<dyn RemoteDrive>,
        store: Arc<MetadataStore>,
        content: Arc<ContentCache>,
        applier: Arc<RemoteApplier>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            high: Mutex::new(VecDeque::new()),
            low: Mutex::new(VecDeque::new()),
            high_capacity: config.high_priority_size,
            low_capacity: config.low_priority_size,
            work: Notify::new(),
            space: Notify::new(),
            pending: DashSet::new(),
            drive,
            store,
            content,
            applier,
            cancel,
            self_ref: std::sync::RwLock::new(std::sync::Weak::new()),
            status: Arc::new(PipelineStatus::default()),
        });
        *queue.self_ref.write().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&queue);
        queue
    }

    /// Spawn `workers` worker tasks.
    pub fn start(&self, workers: usize) {
        for worker in 0..workers {
            let Some(queue) = self
                .self_ref
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .upgrade()
            else {
                return;
            };
            tokio::spawn(async move {
                queue.worker_loop(worker).await;
            });
        }
    }

    /// Pipeline status for diagnostics.
    #[must_use]
    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// Current queue depths `(high, low)`.
    pub async fn depths(&self) -> (usize, usize) {
        (self.high.lock().await.len(), self.low.lock().await.len())
    }

    /// Enqueue a request. Returns false when it was deduplicated.
    pub async fn enqueue(&self, request: MetadataRequest, priority: Priority) -> bool {
        if !self.pending.insert(request.clone()) {
            return false;
        }

        match priority {
            Priority::High => loop {
                {
                    let mut high = self.high.lock().await;
                    if high.len() < self.high_capacity {
                        high.push_back(request);
                        break;
                    }
                }
                // User-facing producers wait for a worker to make room.
                self.space.notified().await;
            },
            Priority::Low => {
                let mut low = self.low.lock().await;
                if low.len() >= self.low_capacity {
                    if let Some(dropped) = low.pop_front() {
                        self.pending.remove(&dropped);
                        tracing::debug!(?dropped, "Prefetch queue full, dropped oldest");
                    }
                }
                low.push_back(request);
            }
        }

        self.work.notify_one();
        true
    }

    async fn pop(&self) -> Option<MetadataRequest> {
        {
            let mut high = self.high.lock().await;
            if let Some(request) = high.pop_front() {
                self.space.notify_one();
                return Some(request);
            }
        }
        self.low.lock().await.pop_front()
    }

    async fn worker_loop(&self, worker: usize) {
        tracing::debug!(worker, "Metadata worker started");
        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => return,
                request = async {
                    loop {
                        if let Some(request) = self.pop().await {
                            return request;
                        }
                        self.work.notified().await;
                    }
                } => request,
            };

            let result = self.process(&request).await;
            self.pending.remove(&request);
            match result {
                Ok(()) => self.status.clear_error(),
                Err(e) if e.is_offline() => {
                    tracing::debug!(?request, "Metadata fetch skipped while offline");
                }
                Err(e) => {
                    tracing::warn!(?request, error = %e, "Metadata fetch failed");
                    self.status.record_error(&e.to_string());
                }
            }
        }
    }

    /// Fetch a directory's children immediately, bypassing the queue.
    /// The filesystem uses this for the first listing of a directory,
    /// where the caller is blocked on the answer.
    pub async fn refresh_children(&self, id: &ItemId) -> Result<(), NimbusError> {
        self.process(&MetadataRequest::Children(id.clone())).await
    }

    /// Fetch one item's metadata immediately, bypassing the queue.
    pub async fn refresh_item(&self, id: &ItemId) -> Result<(), NimbusError> {
        self.process(&MetadataRequest::Item(id.clone())).await
    }

    async fn process(&self, request: &MetadataRequest) -> Result<(), NimbusError> {
        match request {
            MetadataRequest::Item(id) => {
                if id.is_local() {
                    // Nothing to fetch until the upload assigns an id.
                    return Ok(());
                }
                match self.drive.get_item(id).await {
                    Ok(remote) => {
                        self.applier.apply(&remote, false).await?;
                        Ok(())
                    }
                    Err(NimbusError::NotFound(_)) => {
                        // Vanished remotely; drop clean local state.
                        if let Some(record) =
                            self.store.get(id).await.map_err(NimbusError::from)?
                        {
                            if !record.has_local_changes {
                                self.store.delete(id).await.map_err(NimbusError::from)?;
                                self.content.remove(id).map_err(NimbusError::from)?;
                            }
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            MetadataRequest::Children(id) => {
                if id.is_local() {
                    return Ok(());
                }
                let mut next: Option<String> = None;
                loop {
                    let (items, link) = self.drive.list_children(id, next.as_deref()).await?;
                    for remote in &items {
                        self.applier.apply(remote, false).await?;
                    }
                    match link {
                        Some(link) => next = Some(link),
                        None => break,
                    }
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
