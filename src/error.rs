//! Error types for recall-core.

use thiserror::Error;

/// Result type alias using recall-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during trigger analysis or memory service calls.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed rule set or configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No candidate transport responded within its connect budget.
    #[error("Connection to memory service timed out after {duration_ms}ms ({protocol})")]
    ConnectionTimeout { protocol: String, duration_ms: u64 },

    /// Explicit protocol-level rejection (auth failure, bad endpoint).
    /// Distinct from timeout: usually needs a configuration fix.
    #[error("Connection refused by {protocol}: {message}")]
    ConnectionRefused { protocol: String, message: String },

    /// A single operation exceeded its budget on an otherwise healthy connection.
    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },

    /// Transport returned data that cannot be decoded into the expected shape.
    #[error("Malformed response from memory service: {detail}")]
    MalformedResponse { detail: String },

    /// Subprocess or socket I/O error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a connection timeout error.
    pub fn connection_timeout(protocol: impl Into<String>, duration_ms: u64) -> Self {
        Self::ConnectionTimeout {
            protocol: protocol.into(),
            duration_ms,
        }
    }

    /// Create a connection refused error.
    pub fn connection_refused(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionRefused {
            protocol: protocol.into(),
            message: message.into(),
        }
    }

    /// Create an operation timeout error.
    pub fn operation_timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::OperationTimeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create a malformed response error, keeping a bounded prefix of the
    /// raw payload for diagnostics.
    pub fn malformed_response(detail: impl Into<String>, raw: &str) -> Self {
        let prefix: String = raw.chars().take(120).collect();
        Self::MalformedResponse {
            detail: format!("{} (payload prefix: {:?})", detail.into(), prefix),
        }
    }

    /// Whether the caller may reasonably retry after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::OperationTimeout { .. }
                | Self::MalformedResponse { .. }
                | Self::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_response_truncates_payload() {
        let raw = "x".repeat(500);
        let err = Error::malformed_response("bad json", &raw);
        let msg = err.to_string();
        assert!(msg.contains("bad json"));
        assert!(msg.len() < 300);
    }

    #[test]
    fn test_recoverability() {
        assert!(Error::operation_timeout("retrieve", 10_000).is_recoverable());
        assert!(Error::connection_timeout("http", 2_000).is_recoverable());
        assert!(!Error::Config("bad rule".into()).is_recoverable());
        assert!(!Error::connection_refused("http", "401").is_recoverable());
    }
}
