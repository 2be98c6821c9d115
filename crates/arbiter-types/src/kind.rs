//! Machine-readable error kinds shared by every crate in the pipeline.

use serde::{Deserialize, Serialize};

/// Stable identifier for a failure, distinct from its human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unexpected frame.
    Protocol,
    /// The transport could not be established.
    Connection,
    /// An established transport dropped.
    ConnectionLost,
    /// The connection was closed locally.
    ConnectionClosed,
    /// A call exceeded its deadline.
    Timeout,
    /// Connection retries were exhausted.
    ServerUnavailable,
    /// The tool's server is known to be down.
    ToolUnavailable,
    /// No capability with that name.
    ToolNotFound,
    /// The server answered with a JSON-RPC error.
    ServerError,
    /// The invocation was denied.
    PermissionDenied,
    /// No approval decision arrived in time.
    ApprovalTimeout,
    /// The caller cancelled the invocation.
    Cancelled,
    /// Configuration is missing or invalid.
    Config,
    /// A local tool failed outside of its normal result.
    Internal,
}

impl ErrorKind {
    /// The snake_case identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Connection => "connection",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionClosed => "connection_closed",
            Self::Timeout => "timeout",
            Self::ServerUnavailable => "server_unavailable",
            Self::ToolUnavailable => "tool_unavailable",
            Self::ToolNotFound => "tool_not_found",
            Self::ServerError => "server_error",
            Self::PermissionDenied => "permission_denied",
            Self::ApprovalTimeout => "approval_timeout",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
