//! Offline detection.
//!
//! Transport-level failures are classified as offline by matching the
//! error text against a fixed set of patterns, case-insensitively.
//! HTTP responses never imply offline — a server that answered is
//! reachable, whatever it said. The process-wide operational override
//! supersedes the heuristics entirely.

use nimbus_core::context::NimbusContext;
use nimbus_core::NimbusError;

/// Error-text fragments that indicate the network itself is down.
const OFFLINE_PATTERNS: &[&str] = &[
    "no such host",
    "network is unreachable",
    "connection refused",
    "connection timed out",
    "dial tcp",
    "context deadline exceeded",
    "no route to host",
    "network is down",
    "temporary failure in name resolution",
    "operation timed out",
];

/// Returns true if `message` matches an offline pattern.
#[must_use]
pub fn looks_offline(message: &str) -> bool {
    let lower = message.to_lowercase();
    OFFLINE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify a transport error (the request never produced an HTTP
/// response) into `Offline` or `Transient`.
#[must_use]
pub fn classify_transport_error(context: &NimbusContext, err: &reqwest::Error) -> NimbusError {
    // Include the source chain: reqwest wraps the descriptive
    // hyper/io error one or two levels down.
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    if context.operational_offline() || looks_offline(&message) || err.is_connect() {
        NimbusError::Offline(message)
    } else if err.is_timeout() {
        NimbusError::Offline(format!("operation timed out: {message}"))
    } else {
        NimbusError::Transient(message)
    }
}
