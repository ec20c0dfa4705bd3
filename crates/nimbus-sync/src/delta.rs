//! Delta reconciliation loop.
//!
//! Pages the remote change stream from the persisted cursor, applies
//! every change through [`RemoteApplier`], and persists the new cursor
//! once a page set completes. Paced by realtime-link health: a
//! healthy link means the loop only confirms quiet periods on the
//! long fallback interval; a degraded or failed link shortens it; a
//! `notification` event triggers a cycle immediately — the actual
//! state change always flows through the cursor, never the
//! notification payload.
//!
//! The loop is also the offline observer: a cycle failing with an
//! offline classification pauses network expectations, and the first
//! successful cycle after that replays the offline journal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use nimbus_core::ports::realtime_link::{LinkHealth, RealtimeLink, TransportEvent};
use nimbus_core::ports::remote_drive::RemoteDrive;
use nimbus_core::NimbusError;
use nimbus_store::MetadataStore;

use crate::apply::RemoteApplier;
use crate::replay::JournalReplayer;
use crate::stats::PipelineStatus;
use crate::upload::UploadManager;

/// Floor for the shortened (degraded/failed) polling interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Interval used before the link has reported anything.
const STARTUP_INTERVAL: Duration = Duration::from_secs(60);

/// The reconciliation loop.
pub struct DeltaLoop {
    drive: Arc<dyn RemoteDrive>,
    store: Arc<MetadataStore>,
    applier: Arc<RemoteApplier>,
    realtime: Option<Arc<dyn RealtimeLink>>,
    fallback_interval: Duration,
    replayer: Arc<JournalReplayer>,
    upload: Arc<UploadManager>,
    offline: Arc<AtomicBool>,
    cancel: CancellationToken,
    /// Back-reference for spawning the loop from `&self`.
    self_ref: std::sync::RwLock<std::sync::Weak<DeltaLoop>>,
    status: Arc<PipelineStatus>,
}

impl DeltaLoop {
    /// Create the loop; call [`DeltaLoop::start`] to spawn it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drive: Arc<dyn RemoteDrive>,
        store: Arc<MetadataStore>,
        applier: Arc<RemoteApplier>,
        realtime: Option<Arc<dyn RealtimeLink>>,
        fallback_interval: Duration,
        replayer: Arc<JournalReplayer>,
        upload: Arc<UploadManager>,
        offline: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let delta = Arc::new(Self {
            drive,
            store,
            applier,
            realtime,
            fallback_interval,
            replayer,
            upload,
            offline,
            cancel,
            self_ref: std::sync::RwLock::new(std::sync::Weak::new()),
            status: Arc::new(PipelineStatus::default()),
        });
        *delta.self_ref.write().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&delta);
        delta
    }

    /// Spawn the loop, running one cycle immediately.
    pub fn start(&self) {
        let Some(this) = self
            .self_ref
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
        else {
            return;
        };
        tokio::spawn(async move {
            this.cycle_and_log().await;
            this.run().await;
        });
    }

    /// Pipeline status for diagnostics.
    #[must_use]
    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// Current pacing from the link health.
    fn pacing(&self) -> Duration {
        // Without a realtime link (polling-only or disabled) the
        // configured interval IS the polling cadence.
        let Some(link) = &self.realtime else {
            return self.fallback_interval;
        };
        match link.health() {
            // The link will tell us about changes; the long interval
            // only bounds staleness if a notification is lost.
            LinkHealth::Healthy => self.fallback_interval,
            // Notifications may be delayed or lost; polling picks up
            // the slack.
            LinkHealth::Degraded | LinkHealth::Failed => {
                (self.fallback_interval / 4).max(MIN_POLL_INTERVAL)
            }
            LinkHealth::Unknown => STARTUP_INTERVAL,
        }
    }

    async fn run(self: Arc<Self>) {
        let mut events = self.realtime.as_ref().map(|r| r.events());

        loop {
            let interval = self.pacing();

            let wake = Self::wait_for_notification(&mut events);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
                _ = wake => {
                    tracing::debug!("Delta cycle triggered by notification");
                }
            }

            self.cycle_and_log().await;
        }
    }

    /// Resolve when a notification arrives; pend forever without a
    /// transport (or once its channel closes).
    async fn wait_for_notification(
        events: &mut Option<broadcast::Receiver<TransportEvent>>,
    ) {
        let Some(rx) = events.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match rx.recv().await {
                Ok(TransportEvent::Notification { .. }) => return,
                // A health change re-paces the loop (and a degraded
                // link warrants an immediate confirmation cycle).
                Ok(TransportEvent::HealthChanged { .. }) => return,
                // After a lag we may have dropped a notification;
                // cycling is the safe reaction.
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => {
                    *events = None;
                    return std::future::pending().await;
                }
                Ok(_) => continue,
            }
        }
    }

    async fn cycle_and_log(&self) {
        match self.run_cycle().await {
            Ok(applied) => {
                self.status.clear_error();
                if self.offline.swap(false, Ordering::SeqCst) {
                    tracing::info!("Back online; replaying offline journal");
                    match self.replayer.replay().await {
                        Ok(replayed) => {
                            tracing::info!(replayed, "Journal replay finished");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Journal replay interrupted");
                        }
                    }
                    self.upload.kick();
                }
                if applied > 0 {
                    tracing::debug!(applied, "Delta cycle applied changes");
                    self.upload.kick();
                }
            }
            Err(e) if e.is_offline() => {
                if !self.offline.swap(true, Ordering::SeqCst) {
                    tracing::info!("Offline detected; pipelines switch to journaling");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Delta cycle failed");
                self.status.record_error(&e.to_string());
            }
        }
    }

    /// One full cycle: page until the stream is exhausted, then
    /// persist the cursor. Returns the number of applied changes.
    pub async fn run_cycle(&self) -> Result<u64, NimbusError> {
        let cursor = self.store.delta_cursor().await.map_err(NimbusError::from)?;

        let mut page = match self.drive.delta(cursor.as_ref()).await {
            Ok(page) => page,
            // The server expired our cursor: fall back to a full
            // enumeration. Local changes survive (the applier never
            // touches dirty items outside the conflict path).
            Err(NimbusError::NotFound(_)) if cursor.is_some() => {
                tracing::warn!("Delta cursor expired; performing full resync");
                self.store
                    .set_delta_cursor(None)
                    .await
                    .map_err(NimbusError::from)?;
                self.drive.delta(None).await?
            }
            Err(e) => return Err(e),
        };

        let mut applied = 0u64;
        loop {
            for item in &page.items {
                match self.applier.apply(item, true).await {
                    Ok(outcome) => {
                        if !matches!(outcome, crate::apply::ApplyOutcome::Skipped) {
                            applied += 1;
                        }
                    }
                    Err(e) if e.is_offline() => return Err(e),
                    Err(e) => {
                        // One bad item must not wedge the stream.
                        tracing::warn!(item = %item.id, error = %e, "Failed to apply delta item");
                    }
                }
            }

            match page.next_link.take() {
                Some(next) => page = self.drive.delta_next(&next).await?,
                None => {
                    if let Some(cursor) = page.cursor.take() {
                        self.store
                            .set_delta_cursor(Some(&cursor))
                            .await
                            .map_err(NimbusError::from)?;
                        tracing::debug!("Delta cursor advanced");
                    }
                    break;
                }
            }
        }
        Ok(applied)
    }
}
