//! Diagnostic counters.
//!
//! Every pipeline keeps a [`PipelineStatus`]; the engine snapshots
//! them plus queue depths and cache totals into a [`SyncStats`] for
//! the CLI's stats surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;

/// Rolling status of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStatus {
    completed: AtomicU64,
    failed: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl PipelineStatus {
    /// Record a completed unit of work.
    pub fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure and remember its message.
    pub fn record_error(&self, message: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    /// Clear the remembered error after a success.
    pub fn clear_error(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Completed count.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Failure count.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Most recent error message, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A point-in-time snapshot of the engine's health, serializable for
/// the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    /// In-flight hydrations.
    pub hydration_active: usize,
    /// Items waiting for or undergoing upload.
    pub upload_pending: usize,
    /// Items parked after a permanent upload failure.
    pub upload_parked: usize,
    /// Depth of the user-facing metadata queue.
    pub metadata_high_depth: usize,
    /// Depth of the prefetch metadata queue.
    pub metadata_low_depth: usize,
    /// Offline-journal entries awaiting replay.
    pub journal_entries: u64,
    /// Total bytes in the content cache.
    pub cache_bytes: u64,
    /// Records in the metadata store.
    pub item_count: u64,
    /// Realtime link health.
    pub realtime_health: String,
    /// True while pipelines consider the drive unreachable.
    pub offline: bool,
    /// Last error per pipeline, keyed by pipeline name.
    pub last_errors: std::collections::BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counts() {
        let status = PipelineStatus::default();
        status.record_success();
        status.record_error("boom");
        assert_eq!(status.completed(), 1);
        assert_eq!(status.failed(), 1);
        assert_eq!(status.last_error().unwrap(), "boom");

        status.clear_error();
        assert!(status.last_error().is_none());
        assert_eq!(status.completed(), 2);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = SyncStats {
            hydration_active: 1,
            upload_pending: 2,
            upload_parked: 0,
            metadata_high_depth: 0,
            metadata_low_depth: 5,
            journal_entries: 0,
            cache_bytes: 4096,
            item_count: 10,
            realtime_health: "healthy".to_string(),
            offline: false,
            last_errors: Default::default(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["cacheBytes"], serde_json::Value::Null); // field stays snake_case
        assert_eq!(json["cache_bytes"], 4096);
        assert_eq!(json["realtime_health"], "healthy");
    }
}
