//! Process-wide runtime context.
//!
//! Holds the little state that is genuinely process-scoped — the
//! operational offline override and the mount start time — as an
//! explicit object threaded through constructors, so tests can inject
//! their own instead of reaching for globals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Shared runtime context, created once at startup.
#[derive(Debug)]
pub struct NimbusContext {
    /// Forced offline mode. Once set it supersedes the network error
    /// heuristics until cleared.
    operational_offline: AtomicBool,
    started_at: DateTime<Utc>,
}

impl NimbusContext {
    /// Create a context; `offline` preseeds the operational override
    /// (e.g. from a CLI flag).
    #[must_use]
    pub fn new(offline: bool) -> Arc<Self> {
        Arc::new(Self {
            operational_offline: AtomicBool::new(offline),
            started_at: Utc::now(),
        })
    }

    /// Returns true if operational offline mode is active.
    #[must_use]
    pub fn operational_offline(&self) -> bool {
        self.operational_offline.load(Ordering::Relaxed)
    }

    /// Set or clear operational offline mode.
    pub fn set_operational_offline(&self, offline: bool) {
        self.operational_offline.store(offline, Ordering::Relaxed);
        tracing::info!(offline, "Operational offline mode changed");
    }

    /// When this process started serving.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
