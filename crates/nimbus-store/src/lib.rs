//! Persistent local state for NimbusFS.
//!
//! Three cooperating stores share one cache directory per mount:
//!
//! - [`MetadataStore`]: the inode records, the delta cursor, and
//!   resumable upload-session state, in a single SQLite database
//!   (WAL mode, single-writer discipline).
//! - [`ContentCache`]: one backing file per hydrated inode under
//!   `content/`, with per-id write serialization and size tracking.
//! - [`Journal`]: the durable record of mutations performed while
//!   offline, replayed in order on reconnection.

pub mod content;
pub mod journal;
pub mod locks;
pub mod metadata;
pub mod pool;

pub use content::ContentCache;
pub use journal::{Journal, JournalEntry, JournalOp};
pub use locks::ItemLocks;
pub use metadata::MetadataStore;
pub use pool::StorePool;

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not open or create the database.
    #[error("store connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema migration failed.
    #[error("store migration failed: {0}")]
    MigrationFailed(String),

    /// A row could not be mapped to a domain type.
    #[error("store serialization error: {0}")]
    Serialization(String),

    /// Unique-name collision within a parent directory.
    #[error("name already exists in parent: {0}")]
    NameConflict(String),

    /// The requested record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Content file failure.
    #[error("content I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for nimbus_core::NimbusError {
    fn from(err: StoreError) -> Self {
        use nimbus_core::NimbusError;
        match err {
            StoreError::NotFound(msg) => NimbusError::NotFound(msg),
            StoreError::NameConflict(msg) => NimbusError::AlreadyExists(msg),
            StoreError::Serialization(msg) | StoreError::MigrationFailed(msg) => {
                NimbusError::Corruption(msg)
            }
            StoreError::ConnectionFailed(msg) => NimbusError::Corruption(msg),
            StoreError::Database(e) => NimbusError::Corruption(e.to_string()),
            StoreError::Io(e) => NimbusError::Io(e),
        }
    }
}
