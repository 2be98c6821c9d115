//! Risk classification and approval gating for tool invocations.
//!
//! Every invocation is classified into a [`RiskTier`]. The [`PermissionGate`]
//! lets low tiers through according to the active risk profile, replays
//! remembered decisions, and asks an [`ApprovalHandler`] about the rest.
//!
//! ```text
//!   ToolDescriptor + Arguments
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ RiskClassifier  │──► Assessment { tier, reason }
//!     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐   remembered?   ┌───────────────┐
//!     │ PermissionGate  │◄───────────────►│ DecisionStore │
//!     └─────────────────┘                 └───────────────┘
//!              │ prompt (bounded by the approval timeout)
//!              ▼
//!     ┌─────────────────┐
//!     │ ApprovalHandler │──► ApprovalDecision
//!     └─────────────────┘
//! ```

pub mod approval;
pub mod error;
pub mod gate;
pub mod risk;
pub mod store;

pub use approval::{
    ApprovalDecision, ApprovalHandler, ApprovalRequest, AutoDeny, ChannelApprovals, PendingApproval,
};
pub use error::{GateError, Result};
pub use gate::{
    Authorization, DecisionOutcome, DecisionRecord, DecisionSource, DecisionSummary, GateState,
    PermissionGate, auto_approves,
};
pub use risk::{Assessment, RiskClassifier, RiskTier};
pub use store::{DecisionStore, Remembered, decision_key};
