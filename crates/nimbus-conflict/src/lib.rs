//! Conflict resolution.
//!
//! A conflict exists when the local and remote versions of an item
//! both diverged from their last common version: a dirty local edit
//! meets a newer remote etag (detected by the delta loop), or the
//! server rejects an upload's If-Match (412). The resolver applies
//! the configured policy under the item lock and always leaves the
//! item out of the `Conflict` state — hydrated-with-remote-metadata or
//! dirty-and-queued-for-upload.

pub mod namer;
pub mod resolver;

pub use namer::ConflictNamer;
pub use resolver::{ConflictResolver, Resolution};
