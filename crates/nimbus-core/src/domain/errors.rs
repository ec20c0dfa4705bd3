//! Domain error types
//!
//! Errors produced by domain-level validation and state transitions.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// File or directory name rejected by validation
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Malformed remote or local item identifier
    #[error("Invalid item ID: {0}")]
    InvalidId(String),

    /// Malformed quickXorHash (expected Base64 of 20 bytes)
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    /// Malformed or empty ETag
    #[error("Invalid etag: {0}")]
    InvalidEtag(String),

    /// Malformed or empty delta cursor
    #[error("Invalid delta cursor: {0}")]
    InvalidCursor(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// The current state
        from: &'static str,
        /// The attempted target state
        to: &'static str,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidName("a/b".to_string());
        assert_eq!(err.to_string(), "Invalid name: a/b");

        let err = DomainError::InvalidTransition {
            from: "Ghost",
            to: "Uploading",
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from Ghost to Uploading"
        );
    }

    #[test]
    fn test_error_equality() {
        let a = DomainError::InvalidId("x".to_string());
        let b = DomainError::InvalidId("x".to_string());
        let c = DomainError::InvalidId("y".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
