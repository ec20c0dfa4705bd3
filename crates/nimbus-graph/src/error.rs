//! HTTP response classification.
//!
//! Maps Graph status codes onto the process error taxonomy. Offline
//! classification (transport failures) lives in [`crate::offline`];
//! a response, whatever its status, is never offline.

use reqwest::StatusCode;

use nimbus_core::NimbusError;

/// Map an error status to a [`NimbusError`].
///
/// `body` is the (possibly truncated) response text, used only for
/// error messages — never logged with secrets, since Graph error
/// bodies carry no credentials.
#[must_use]
pub fn status_to_error(status: StatusCode, body: &str) -> NimbusError {
    let detail = summarize(body);
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => NimbusError::NotFound(detail),
        StatusCode::CONFLICT => NimbusError::AlreadyExists(detail),
        StatusCode::PRECONDITION_FAILED => NimbusError::PreconditionFailed(detail),
        StatusCode::UNAUTHORIZED => NimbusError::AuthExpired,
        StatusCode::FORBIDDEN => NimbusError::PermissionDenied(detail),
        StatusCode::BAD_REQUEST if detail.contains("invalidName") => {
            NimbusError::InvalidName(detail)
        }
        StatusCode::TOO_MANY_REQUESTS => NimbusError::Transient(format!("429: {detail}")),
        s if s.is_server_error() => NimbusError::Transient(format!("{s}: {detail}")),
        s => NimbusError::Io(std::io::Error::other(format!("HTTP {s}: {detail}"))),
    }
}

/// Returns true if a response with this status should be retried.
#[must_use]
pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Keep error bodies short enough for logs.
fn summarize(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_statuses() {
        assert!(matches!(
            status_to_error(StatusCode::NOT_FOUND, ""),
            NimbusError::NotFound(_)
        ));
        assert!(matches!(
            status_to_error(StatusCode::CONFLICT, ""),
            NimbusError::AlreadyExists(_)
        ));
        assert!(matches!(
            status_to_error(StatusCode::PRECONDITION_FAILED, ""),
            NimbusError::PreconditionFailed(_)
        ));
        assert!(matches!(
            status_to_error(StatusCode::UNAUTHORIZED, ""),
            NimbusError::AuthExpired
        ));
        assert!(matches!(
            status_to_error(StatusCode::FORBIDDEN, ""),
            NimbusError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::PRECONDITION_FAILED));
    }

    #[test]
    fn test_transient_for_server_errors() {
        let err = status_to_error(StatusCode::BAD_GATEWAY, "upstream");
        assert!(err.is_transient());
    }

    #[test]
    fn test_invalid_name_detection() {
        let body = r#"{"error":{"code":"invalidName","message":"bad"}}"#;
        assert!(matches!(
            status_to_error(StatusCode::BAD_REQUEST, body),
            NimbusError::InvalidName(_)
        ));
    }

    #[test]
    fn test_other_4xx_is_permanent_io() {
        let err = status_to_error(StatusCode::METHOD_NOT_ALLOWED, "");
        assert!(matches!(err, NimbusError::Io(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_summarize_truncates_long_bodies() {
        let body = "x".repeat(1000);
        let err = status_to_error(StatusCode::INTERNAL_SERVER_ERROR, &body);
        assert!(err.to_string().len() < 400);
    }
}
