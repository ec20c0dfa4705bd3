//! Process-wide error taxonomy.
//!
//! Every pipeline and adapter maps its failures into [`NimbusError`]
//! at the boundary where a decision has to be made: retry, journal,
//! conflict, or surface to the caller. The FUSE layer translates these
//! into errnos.

use thiserror::Error;

use crate::domain::DomainError;

/// The error taxonomy shared across the workspace.
#[derive(Debug, Error)]
pub enum NimbusError {
    /// The item does not exist (locally or remotely).
    #[error("not found: {0}")]
    NotFound(String),

    /// A name collision within a parent directory.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The name is rejected by validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The operation is not permitted.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The network is unreachable (heuristic or operational override).
    /// Pipelines pause network work and switch to journaling; cached
    /// reads keep succeeding.
    #[error("offline: {0}")]
    Offline(String),

    /// A retryable failure (5xx, 429, transient network jitter).
    /// Absorbed by backoff; surfaces only after the retry budget.
    #[error("transient error: {0}")]
    Transient(String),

    /// The access token expired; refresh and retry.
    #[error("authentication expired")]
    AuthExpired,

    /// Refresh was rejected; the embedder must re-authenticate.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Optimistic concurrency failure (412 / etag mismatch); routes
    /// the item into the conflict path.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Content hash mismatch after hydration; retried once, then
    /// surfaced as an I/O error.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The local store or cache is damaged. Fatal: the mount exits
    /// cleanly rather than serving bad data.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Domain validation or state-machine violation.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NimbusError {
    /// Returns true if the operation should be retried with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, NimbusError::Transient(_))
    }

    /// Returns true if pipelines should pause network work and start
    /// journaling instead of failing.
    #[must_use]
    pub fn is_offline(&self) -> bool {
        matches!(self, NimbusError::Offline(_))
    }

    /// Returns true if the failure is permanent for this operation
    /// (no retry will help; the item is marked and the queue moves on).
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !matches!(
            self,
            NimbusError::Transient(_) | NimbusError::Offline(_) | NimbusError::AuthExpired
        )
    }

    /// Stable kind string used in logs and the stats surface.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            NimbusError::NotFound(_) => "not_found",
            NimbusError::AlreadyExists(_) => "already_exists",
            NimbusError::InvalidName(_) => "invalid_name",
            NimbusError::PermissionDenied(_) => "permission_denied",
            NimbusError::Offline(_) => "offline",
            NimbusError::Transient(_) => "transient",
            NimbusError::AuthExpired => "auth_expired",
            NimbusError::AuthFailed(_) => "auth_failed",
            NimbusError::PreconditionFailed(_) => "precondition_failed",
            NimbusError::Integrity(_) => "integrity",
            NimbusError::Corruption(_) => "corruption",
            NimbusError::Domain(DomainError::InvalidName(_)) => "invalid_name",
            NimbusError::Domain(_) => "domain",
            NimbusError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_helpers() {
        assert!(NimbusError::Transient("503".to_string()).is_transient());
        assert!(NimbusError::Offline("no such host".to_string()).is_offline());
        assert!(!NimbusError::Transient("503".to_string()).is_permanent());
        assert!(!NimbusError::Offline("x".to_string()).is_permanent());
        assert!(!NimbusError::AuthExpired.is_permanent());
        assert!(NimbusError::NotFound("x".to_string()).is_permanent());
        assert!(NimbusError::PreconditionFailed("etag".to_string()).is_permanent());
    }

    #[test]
    fn test_domain_error_converts() {
        let err: NimbusError = DomainError::InvalidName("a:b".to_string()).into();
        assert_eq!(err.kind(), "invalid_name");
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(NimbusError::AuthExpired.kind(), "auth_expired");
        assert_eq!(
            NimbusError::Corruption("bad page".to_string()).kind(),
            "corruption"
        );
    }
}
