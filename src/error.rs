//! Error types and error classification for relay operations.
//!
//! Classification drives the retry policy: connection-class errors are
//! retried with backoff and count toward an upstream's consecutive-failure
//! tally, while business-class errors surface to the caller unchanged and
//! never demote the upstream that produced them.

use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Duplicate upstream name found in config
    #[error("duplicate upstream name: {0}")]
    DuplicateName(String),

    /// Invalid configuration for a named upstream
    #[error("invalid config for upstream '{0}': {1}")]
    InvalidConfig(String, String),

    /// Initialization failed for a named upstream
    #[error("initialization failed for upstream '{0}': {1}")]
    InitializationFailed(String, String),

    /// Transport-level error for a named upstream
    #[error("transport error for upstream '{0}': {1}")]
    Transport(String, String),

    /// MCP protocol error for a named upstream (upstream message preserved)
    #[error("upstream '{0}' returned an error: {1}")]
    Upstream(String, String),

    /// Call to a named upstream timed out
    #[error("request timeout for upstream '{0}'")]
    CallTimeout(String),

    /// Entity unknown after a routing-table rebuild
    #[error("{kind} '{name}' is not available on any connected server")]
    NotAvailable { kind: &'static str, name: String },

    /// No upstream is registered under the given name
    #[error("no upstream named '{0}'")]
    UnknownUpstream(String),

    /// Upstream is shutting down
    #[error("upstream '{0}' shutting down")]
    ShuttingDown(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// How a failed upstream request should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport down, timeout, DNS failure, connection refused.
    /// Retriable; counts toward consecutive failures; demotes at the threshold.
    Connection,
    /// Entity-not-found, invalid parameters, upstream policy rejection.
    /// Never retried, never demotes; surfaced to the caller unchanged.
    Business,
}

/// Pluggable classification predicate over an error's display message.
pub type ErrorClassifier = fn(&str) -> ErrorClass;

/// Message substrings that mark an error as connection-class.
///
/// Preserved verbatim for compatibility with deployments that match on
/// upstream error text. An error is connection-class only if it contains
/// one of these tokens; everything else is business-class.
const CONNECTION_TOKENS: [&str; 4] = ["Connection", "timeout", "ECONNREFUSED", "ENOTFOUND"];

/// Default classifier: substring match on the listed connection tokens.
pub fn classify_error(message: &str) -> ErrorClass {
    if CONNECTION_TOKENS.iter().any(|t| message.contains(t)) {
        ErrorClass::Connection
    } else {
        ErrorClass::Business
    }
}

/// True when an upstream rejection names a missing entity, which triggers
/// eviction of the stale routing-table entry.
pub fn is_not_found(message: &str) -> bool {
    message.contains("not found") || message.contains("Not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_name_display() {
        let err = RelayError::DuplicateName("search".to_string());
        assert_eq!(err.to_string(), "duplicate upstream name: search");
    }

    #[test]
    fn test_not_available_display() {
        let err = RelayError::NotAvailable {
            kind: "tool",
            name: "t1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "tool 't1' is not available on any connected server"
        );
    }

    #[test]
    fn test_call_timeout_is_connection_class() {
        let err = RelayError::CallTimeout("search".to_string());
        assert_eq!(classify_error(&err.to_string()), ErrorClass::Connection);
    }

    #[test]
    fn test_connection_tokens_classify_as_connection() {
        for msg in [
            "Connection closed",
            "request timeout for upstream 'a'",
            "connect ECONNREFUSED 127.0.0.1:9000",
            "getaddrinfo ENOTFOUND nowhere.invalid",
        ] {
            assert_eq!(classify_error(msg), ErrorClass::Connection, "{msg}");
        }
    }

    #[test]
    fn test_business_messages_classify_as_business() {
        for msg in [
            "Tool t1 not found",
            "Invalid parameters: missing 'query'",
            "blocked by robots.txt",
            "internal upstream failure",
        ] {
            assert_eq!(classify_error(msg), ErrorClass::Business, "{msg}");
        }
    }

    #[test]
    fn test_not_available_is_business_class() {
        // The routing-miss message must not demote upstreams.
        let err = RelayError::NotAvailable {
            kind: "prompt",
            name: "summarize".to_string(),
        };
        assert_eq!(classify_error(&err.to_string()), ErrorClass::Business);
    }

    #[test]
    fn test_is_not_found() {
        assert!(is_not_found("Tool t1 not found"));
        assert!(is_not_found("Not found: prompt 'x'"));
        assert!(!is_not_found("Invalid parameters"));
    }
}
