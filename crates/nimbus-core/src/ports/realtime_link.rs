//! Realtime transport port.
//!
//! The delta loop subscribes to transport events and adjusts its
//! pacing from the link health; it never reads notification payloads
//! beyond "a change happened" — the actual state change always flows
//! through the delta cursor.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::NimbusError;

/// Health of the realtime link, driving delta-loop pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkHealth {
    /// Not yet connected.
    #[default]
    Unknown,
    /// Connected, heartbeats on time.
    Healthy,
    /// Heartbeats missed; notifications may be delayed.
    Degraded,
    /// Gave up reconnecting; polling carries the full burden.
    Failed,
}

impl LinkHealth {
    /// Name for logs and the stats surface.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            LinkHealth::Unknown => "unknown",
            LinkHealth::Healthy => "healthy",
            LinkHealth::Degraded => "degraded",
            LinkHealth::Failed => "failed",
        }
    }
}

/// Strongly-typed events emitted by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Initial connection established (handshake completed).
    Connected,
    /// Connection re-established after a drop.
    Reconnected,
    /// Connection lost; reconnect pending.
    Disconnected { reason: String },
    /// The remote signalled that the delta cursor should be advanced.
    /// The payload is opaque and intentionally unused.
    Notification { payload: String },
    /// Transport-level error worth surfacing in diagnostics.
    Error { message: String },
    /// Health state changed.
    HealthChanged { health: LinkHealth },
}

/// Port for the realtime notification transport.
#[async_trait]
pub trait RealtimeLink: Send + Sync {
    /// Connect and complete the handshake. Returns only after the
    /// handshake packet has been read and dispatched, so the caller's
    /// first observable event is `Connected`.
    async fn connect(&self) -> Result<(), NimbusError>;

    /// Subscribe to the event stream.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Current link health.
    fn health(&self) -> LinkHealth;

    /// Stop the read and heartbeat loops and close the socket.
    async fn shutdown(&self);
}
