//! Error types for the tool catalog and pipeline.

use arbiter_gate::{GateError, RiskTier};
use arbiter_mcp::McpError;
use arbiter_types::ErrorKind;
use thiserror::Error;

/// Result type alias using the tool error type.
pub type Result<T> = std::result::Result<T, ToolError>;

/// Error type for tool operations.
///
/// A tool that runs and reports a failure is not an error: it yields
/// [`arbiter_types::ToolResult::Error`]. These are the cases where the tool
/// could not be run at all.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No capability with that name.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The owning server is known to be down.
    #[error("tool '{capability}' is unavailable: server '{server}' {reason}")]
    Unavailable {
        /// Capability name.
        capability: String,
        /// Owning server.
        server: String,
        /// Why the server cannot be used.
        reason: String,
    },

    /// Remote call failed.
    #[error(transparent)]
    Remote(#[from] McpError),

    /// Refused by the permission gate.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// A local tool failed to execute.
    #[error("tool '{capability}' failed: {message}")]
    Execution {
        /// Capability name.
        capability: String,
        /// What went wrong.
        message: String,
    },

    /// The caller cancelled the invocation.
    #[error("invocation of '{0}' was cancelled")]
    Cancelled(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] arbiter_config::ConfigError),
}

impl ToolError {
    /// Create an unavailable error.
    pub fn unavailable(
        capability: impl Into<String>,
        server: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unavailable {
            capability: capability.into(),
            server: server.into(),
            reason: reason.into(),
        }
    }

    /// Create an execution error.
    pub fn execution(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::ToolNotFound,
            Self::Unavailable { .. } => ErrorKind::ToolUnavailable,
            Self::Remote(e) => e.kind(),
            Self::Gate(e) => e.kind(),
            Self::Execution { .. } => ErrorKind::Internal,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Risk tier of a refused invocation.
    pub fn tier(&self) -> Option<RiskTier> {
        match self {
            Self::Gate(e) => e.tier(),
            _ => None,
        }
    }

    /// Whether the gate refused the invocation.
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::Gate(e) if e.is_denial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ToolError::NotFound("x".into()).kind(), ErrorKind::ToolNotFound);
        assert_eq!(
            ToolError::unavailable("fs_read_file", "fs", "has failed").kind(),
            ErrorKind::ToolUnavailable
        );
        assert_eq!(ToolError::from(McpError::lost("fs")).kind(), ErrorKind::ConnectionLost);
        assert_eq!(ToolError::Cancelled("x".into()).kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_denial_carries_tier() {
        let err = ToolError::from(GateError::denied("bash", RiskTier::Critical, "user denied"));
        assert!(err.is_denial());
        assert_eq!(err.tier(), Some(RiskTier::Critical));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("critical"));
    }

    #[test]
    fn test_unavailable_message() {
        let err = ToolError::unavailable("fs_read_file", "fs", "has failed");
        assert_eq!(
            err.to_string(),
            "tool 'fs_read_file' is unavailable: server 'fs' has failed"
        );
    }
}
