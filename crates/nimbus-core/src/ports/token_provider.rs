//! Token provider port.
//!
//! The drive adapter consumes bearer tokens through this trait and
//! never sees how they are obtained. The production implementation is
//! the file-backed store with refresh in `nimbus-graph`; the embedder
//! may substitute its own (e.g. a desktop keychain flow).

use async_trait::async_trait;

use crate::errors::NimbusError;

/// Yields bearer tokens for the remote API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a currently-valid bearer token, refreshing if the cached
    /// one has expired.
    ///
    /// # Errors
    /// - `NimbusError::AuthExpired` when a refresh is required but not
    ///   possible right now (e.g. offline);
    /// - `NimbusError::AuthFailed` when the refresh was rejected and
    ///   the embedder must re-authenticate interactively.
    async fn bearer_token(&self) -> Result<String, NimbusError>;

    /// Drop any cached token so the next call refreshes. Called by the
    /// drive adapter after a 401.
    async fn invalidate(&self);
}
