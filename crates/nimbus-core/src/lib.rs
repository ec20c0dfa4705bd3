//! Core domain model and ports for NimbusFS.
//!
//! This crate holds everything the rest of the workspace agrees on:
//! the inode record and its state machine, validated newtypes for
//! remote identifiers, the error taxonomy, configuration, the
//! quickXorHash implementation, retry backoff, and the port traits
//! implemented by the adapter crates (`nimbus-graph`,
//! `nimbus-realtime`).
//!
//! It deliberately has no knowledge of SQLite, HTTP, or FUSE.

pub mod backoff;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod ports;
pub mod quickxor;

pub use domain::item::{ItemKind, ItemRecord, ItemState};
pub use domain::newtypes::{ContentHash, DeltaCursor, ETag, FileName, ItemId};
pub use errors::NimbusError;
