//! FUSE bridge.
//!
//! Translates kernel VFS operations into calls against the engine's
//! stores and pipelines. Synchronous FUSE callbacks bridge into the
//! tokio runtime through a stored handle; user-facing waits (a read
//! on a ghost, a first directory listing) block on the corresponding
//! pipeline with a bounded timeout.
//!
//! Lock order is parent before child, metadata store before content
//! cache, everywhere.

pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode_table;
pub mod mount;
pub mod virtual_files;

pub use filesystem::NimbusFs;
pub use mount::{mount, MountOptions};
