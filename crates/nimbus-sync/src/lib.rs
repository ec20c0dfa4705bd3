//! Synchronization pipelines.
//!
//! Four cooperating worker sets move state between the kernel-facing
//! stores and the remote drive:
//!
//! - [`HydrationPool`]: `Ghost → Hydrated`, on demand, deduplicated,
//!   hash-verified.
//! - [`MetadataQueue`]: two-priority metadata fetches (user-facing
//!   getattr/readdir ahead of speculative prefetch).
//! - [`UploadManager`]: `DirtyLocal → Uploading → Hydrated`, with
//!   If-Match guarding, session resume, per-item backoff, and the
//!   conflict path on 412.
//! - [`DeltaLoop`]: pages the remote change stream, applies it to the
//!   metadata store, invalidates stale content, and detects
//!   conflicts. Paced by realtime-link health.
//!
//! [`SyncEngine`] owns the wiring, the offline journal replay, cache
//! eviction, and drain-then-stop shutdown.

pub mod apply;
pub mod delta;
pub mod engine;
pub mod hydration;
pub mod metadata_queue;
pub mod replay;
pub mod stats;
pub mod upload;

pub use engine::{StoreSessionPersistence, SyncEngine};
pub use stats::SyncStats;
