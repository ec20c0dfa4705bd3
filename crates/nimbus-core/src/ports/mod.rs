//! Port traits implemented by the adapter crates.
//!
//! `RemoteDrive` is implemented by the Graph adapter, `TokenProvider`
//! by the file-backed token store (or the embedder's auth stack), and
//! `RealtimeLink` by the Engine.IO transport. Concrete types, no
//! hierarchies; tests substitute their own implementations.

pub mod realtime_link;
pub mod remote_drive;
pub mod token_provider;

pub use realtime_link::{LinkHealth, RealtimeLink, TransportEvent};
pub use remote_drive::{DeltaPage, DriveQuota, ItemPatch, RealtimeEndpoint, RemoteDrive, RemoteItem};
pub use token_provider::TokenProvider;
