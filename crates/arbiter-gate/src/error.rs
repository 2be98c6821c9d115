//! Error types for the permission gate.

use std::path::PathBuf;
use std::time::Duration;

use arbiter_types::ErrorKind;
use thiserror::Error;

use crate::risk::RiskTier;

/// Result type for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;

/// Error type for gate operations.
#[derive(Debug, Error)]
pub enum GateError {
    /// The invocation was refused.
    #[error("permission denied for '{capability}' ({tier} risk): {reason}")]
    PermissionDenied {
        /// Capability name.
        capability: String,
        /// Assessed risk tier.
        tier: RiskTier,
        /// Why it was refused.
        reason: String,
    },

    /// No decision arrived in time; the invocation was refused.
    #[error("approval for '{capability}' ({tier} risk) timed out after {timeout:?}")]
    ApprovalTimeout {
        /// Capability name.
        capability: String,
        /// Assessed risk tier.
        tier: RiskTier,
        /// The approval timeout that elapsed.
        timeout: Duration,
    },

    /// A configured critical pattern is not a valid regex.
    #[error("invalid critical pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Compilation error.
        #[source]
        source: regex::Error,
    },

    /// The decision store could not be read or written.
    #[error("decision store {path}: {source}")]
    Store {
        /// Store file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl GateError {
    /// Create a permission-denied error.
    pub fn denied(capability: impl Into<String>, tier: RiskTier, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            capability: capability.into(),
            tier,
            reason: reason.into(),
        }
    }

    /// Machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ApprovalTimeout { .. } => ErrorKind::ApprovalTimeout,
            Self::InvalidPattern { .. } => ErrorKind::Config,
            Self::Store { .. } => ErrorKind::Internal,
        }
    }

    /// Risk tier of a refused invocation.
    pub fn tier(&self) -> Option<RiskTier> {
        match self {
            Self::PermissionDenied { tier, .. } | Self::ApprovalTimeout { tier, .. } => Some(*tier),
            _ => None,
        }
    }

    /// Whether the invocation was refused, by a decision or by the timeout.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::ApprovalTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_display_and_kind() {
        let err = GateError::denied("shell_exec", RiskTier::Critical, "user denied");
        assert_eq!(
            err.to_string(),
            "permission denied for 'shell_exec' (critical risk): user denied"
        );
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.tier(), Some(RiskTier::Critical));
        assert!(err.is_denial());
    }

    #[test]
    fn test_timeout_is_denial() {
        let err = GateError::ApprovalTimeout {
            capability: "fs_write".into(),
            tier: RiskTier::Medium,
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.kind(), ErrorKind::ApprovalTimeout);
        assert!(err.is_denial());
        assert!(err.to_string().contains("2s"));
    }
}
