//! Error types for remote tool server operations.

use std::time::Duration;

use arbiter_types::ErrorKind;
use thiserror::Error;

use crate::protocol::JsonRpcError;

/// Result type for remote tool server operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Error type for remote tool server operations.
///
/// Payloads are plain strings so the error is `Clone`: a single failed
/// connection attempt is reported to every caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport could not be established or the handshake failed.
    #[error("cannot connect to '{server}': {message}")]
    Connection {
        /// Server name.
        server: String,
        /// What went wrong.
        message: String,
    },

    /// The transport dropped while the call was outstanding.
    #[error("connection to '{server}' was lost")]
    ConnectionLost {
        /// Server name.
        server: String,
    },

    /// The connection was closed locally.
    #[error("connection to '{server}' was closed")]
    ConnectionClosed {
        /// Server name.
        server: String,
    },

    /// No response arrived before the deadline.
    #[error("'{method}' on '{server}' timed out after {timeout:?}")]
    Timeout {
        /// Server name.
        server: String,
        /// Method that was called.
        method: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// Every connection attempt failed.
    #[error("server '{server}' is unavailable after {attempts} attempt(s): {last_error}")]
    ServerUnavailable {
        /// Server name.
        server: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// The server answered with an error response.
    #[error("server error {code}: {message}")]
    ServerError {
        /// Error code from the server.
        code: i64,
        /// Error message from the server.
        message: String,
        /// Optional additional data.
        data: Option<serde_json::Value>,
    },

    /// No server with that name is registered.
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    /// The server is registered but disabled.
    #[error("server '{0}' is disabled")]
    Disabled(String),
}

impl McpError {
    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a connection error.
    pub fn connection(server: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: msg.into(),
        }
    }

    /// Create a connection lost error.
    pub fn lost(server: impl Into<String>) -> Self {
        Self::ConnectionLost {
            server: server.into(),
        }
    }

    /// Create a connection closed error.
    pub fn closed(server: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            server: server.into(),
        }
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ServerUnavailable { .. } => ErrorKind::ServerUnavailable,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::UnknownServer(_) | Self::Disabled(_) => ErrorKind::Config,
        }
    }

    /// Whether the pool should reconnect and retry once.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        Self::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = McpError::connection("fs", "connection refused");
        assert!(err.to_string().contains("'fs'"));
        assert!(err.to_string().contains("connection refused"));

        let err = McpError::ServerError {
            code: -32600,
            message: "Invalid Request".to_string(),
            data: None,
        };
        assert!(err.to_string().contains("-32600"));
        assert!(err.to_string().contains("Invalid Request"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(McpError::lost("fs").kind(), ErrorKind::ConnectionLost);
        assert_eq!(McpError::closed("fs").kind(), ErrorKind::ConnectionClosed);
        assert_eq!(McpError::protocol("bad").kind(), ErrorKind::Protocol);
        let timeout = McpError::Timeout {
            server: "fs".to_string(),
            method: "ping".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(timeout.to_string().contains("5s"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: McpError = json_err.into();
        assert!(matches!(err, McpError::Protocol(_)));
    }

    #[test]
    fn test_rpc_error_conversion() {
        let err: McpError = JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, "nope").into();
        assert!(matches!(err, McpError::ServerError { code: -32601, .. }));
    }
}
