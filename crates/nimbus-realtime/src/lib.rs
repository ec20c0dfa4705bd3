//! Realtime change-notification transport.
//!
//! An Engine.IO v4 client over WebSocket with Socket.IO message
//! framing. The remote pushes `notification` events when the drive
//! changes; the transport surfaces them as typed events and tracks
//! its own health so the delta loop can pace itself. It never fetches
//! changes itself — the delta cursor remains the single source of
//! state transitions.

pub mod packet;
pub mod transport;

pub use transport::{RealtimeMode, RealtimeTransport, TransportConfig};
