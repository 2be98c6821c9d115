//! Approval requests and the consumers that answer them.
//!
//! The gate never talks to a user directly. It hands an [`ApprovalRequest`] to
//! an [`ApprovalHandler`] and waits for an [`ApprovalDecision`]. Frontends
//! either implement the trait or take [`PendingApproval`]s off a
//! [`ChannelApprovals`] receiver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use arbiter_types::{Arguments, ToolDescriptor};

use crate::risk::RiskTier;

/// Longest rendered argument value in a summary.
const MAX_VALUE_CHARS: usize = 80;

/// A user's answer to an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Run this invocation only.
    AllowOnce,
    /// Run, and stop asking for this capability.
    AllowAlways,
    /// Refuse this invocation only.
    Deny,
    /// Refuse, and keep refusing without asking.
    DenyAlways,
}

impl ApprovalDecision {
    /// Whether the invocation may run.
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AllowOnce => "allow once",
            Self::AllowAlways => "allow always",
            Self::Deny => "deny",
            Self::DenyAlways => "deny always",
        };
        f.write_str(s)
    }
}

/// What the approval consumer is shown.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    /// Unique id of this prompt.
    pub id: Uuid,
    /// The capability being invoked.
    pub descriptor: ToolDescriptor,
    /// Assessed risk tier.
    pub tier: RiskTier,
    /// Why the tier was assigned.
    pub reason: String,
    /// One line per argument, values truncated.
    pub argument_summary: String,
    /// When the prompt was raised.
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Build a request for an invocation.
    pub fn new(descriptor: ToolDescriptor, tier: RiskTier, reason: impl Into<String>, args: &Arguments) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            tier,
            reason: reason.into(),
            argument_summary: summarize(args),
            created_at: Utc::now(),
        }
    }

    /// Capability name.
    pub fn capability(&self) -> &str {
        &self.descriptor.name
    }
}

/// Render arguments as `key: value` lines, sorted by key.
pub fn summarize(args: &Arguments) -> String {
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|key| {
            let rendered = match &args[key] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}: {}", key, truncate(&rendered, MAX_VALUE_CHARS))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(s: &str, max_chars: usize) -> String {
    let single_line = s.replace('\n', "\\n");
    match single_line.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &single_line[..end]),
        None => single_line,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Answers approval requests.
///
/// The gate bounds every call with its approval timeout, so implementations
/// may wait on a user indefinitely.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide on `request`.
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision;
}

/// Denies everything. Used when no frontend is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

#[async_trait]
impl ApprovalHandler for AutoDeny {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        tracing::debug!(capability = %request.capability(), tier = %request.tier, "no approval frontend, denying");
        ApprovalDecision::Deny
    }
}

/// Approves everything. Test-only.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AutoAllow;

#[cfg(test)]
#[async_trait]
impl ApprovalHandler for AutoAllow {
    async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::AllowOnce
    }
}

/// An approval request waiting for a frontend to answer.
#[derive(Debug)]
pub struct PendingApproval {
    /// The prompt to show.
    pub request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    /// Answer the prompt. Returns false if the gate stopped waiting.
    pub fn respond(self, decision: ApprovalDecision) -> bool {
        self.responder.send(decision).is_ok()
    }
}

/// Forwards approval requests over a channel.
///
/// A closed channel, or a [`PendingApproval`] dropped without an answer, is
/// treated as [`ApprovalDecision::Deny`].
#[derive(Debug, Clone)]
pub struct ChannelApprovals {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApprovals {
    /// Create the handler and the receiving end for the frontend.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalHandler for ChannelApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (responder, decision) = oneshot::channel();
        let capability = request.capability().to_string();
        if self.tx.send(PendingApproval { request, responder }).await.is_err() {
            tracing::warn!(capability = %capability, "approval channel closed, denying");
            return ApprovalDecision::Deny;
        }
        decision.await.unwrap_or_else(|_| {
            tracing::warn!(capability = %capability, "approval dropped without a decision, denying");
            ApprovalDecision::Deny
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_types::ToolCategory;
    use serde_json::json;

    fn request() -> ApprovalRequest {
        let descriptor = ToolDescriptor::local("bash", "", json!({}), ToolCategory::Execute);
        let mut args = Arguments::new();
        args.insert("command".into(), json!("ls"));
        ApprovalRequest::new(descriptor, RiskTier::Medium, "shell execution", &args)
    }

    #[test]
    fn test_summarize() {
        let mut args = Arguments::new();
        args.insert("path".into(), json!("a.txt"));
        args.insert("content".into(), json!("x".repeat(200)));
        args.insert("force".into(), json!(true));

        let summary = summarize(&args);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("content: xxx"));
        assert!(lines[0].ends_with("..."));
        assert_eq!(lines[0].len(), "content: ".len() + MAX_VALUE_CHARS + 3);
        assert_eq!(lines[1], "force: true");
        assert_eq!(lines[2], "path: a.txt");
        assert_eq!(summarize(&Arguments::new()), "");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("a\nb", 10), "a\\nb");
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let (handler, mut rx) = ChannelApprovals::new(4);
        let frontend = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.capability(), "bash");
            assert_eq!(pending.request.argument_summary, "command: ls");
            assert!(pending.respond(ApprovalDecision::AllowAlways));
        });
        assert_eq!(
            handler.request_approval(request()).await,
            ApprovalDecision::AllowAlways
        );
        frontend.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_closed_denies() {
        let (handler, rx) = ChannelApprovals::new(1);
        drop(rx);
        assert_eq!(handler.request_approval(request()).await, ApprovalDecision::Deny);

        let (handler, mut rx) = ChannelApprovals::new(1);
        let frontend = tokio::spawn(async move {
            drop(rx.recv().await.unwrap());
        });
        assert_eq!(handler.request_approval(request()).await, ApprovalDecision::Deny);
        frontend.await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_deny() {
        assert_eq!(AutoDeny.request_approval(request()).await, ApprovalDecision::Deny);
        assert!(!ApprovalDecision::DenyAlways.is_allow());
        assert!(ApprovalDecision::AllowOnce.is_allow());
    }
}
