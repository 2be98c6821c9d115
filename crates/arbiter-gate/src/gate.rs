//! The permission gate.
//!
//! `authorize` runs, in order:
//!
//! 1. classify the invocation
//! 2. a remembered deny is refused without a prompt, at any tier
//! 3. a remembered allow runs without a prompt, below Critical only
//! 4. tiers auto-approved by the risk profile run without a prompt
//! 5. otherwise the approval handler is asked, bounded by the approval timeout
//!
//! A decision key holds one remembered decision, so 2 and 3 never both apply;
//! a later answer replaces the earlier one. A remembered allow on a Critical
//! invocation falls through to the prompt. A timeout is a denial.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use arbiter_config::{AlwaysAllowScope, ArbiterConfig, RiskProfile};
use arbiter_types::{Arguments, ToolDescriptor};

use crate::approval::{ApprovalDecision, ApprovalHandler, ApprovalRequest};
use crate::error::{GateError, Result};
use crate::risk::{Assessment, RiskClassifier, RiskTier};
use crate::store::{DecisionStore, Remembered, decision_key};

const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// No decision made yet.
    Idle,
    /// At least one invocation is waiting for approval.
    AwaitingApproval,
    /// The last pending approval has been decided.
    Resolved,
}

/// How an allowed invocation got through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// The risk profile auto-approves the tier.
    Profile,
    /// A remembered decision.
    Remembered,
    /// The approval handler was asked.
    Prompt,
}

/// Final outcome recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// The invocation may run.
    Allowed,
    /// The invocation was refused.
    Denied,
    /// No decision arrived in time; refused.
    TimedOut,
}

/// A successful authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Authorization {
    /// Capability name.
    pub capability: String,
    /// Assessed tier.
    pub tier: RiskTier,
    /// Why the tier was assigned.
    pub reason: String,
    /// What allowed it.
    pub source: DecisionSource,
}

/// One entry of the audit history.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    /// Capability name.
    pub capability: String,
    /// Assessed tier.
    pub tier: RiskTier,
    /// What happened.
    pub outcome: DecisionOutcome,
    /// Where the decision came from.
    pub source: DecisionSource,
    /// The handler's answer, when one was asked.
    pub decision: Option<ApprovalDecision>,
    /// When the decision was made.
    pub at: DateTime<Utc>,
}

/// Counts over the audit history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecisionSummary {
    /// Records in the history.
    pub total: usize,
    /// Allowed invocations.
    pub allowed: usize,
    /// Denied invocations.
    pub denied: usize,
    /// Approval timeouts.
    pub timed_out: usize,
    /// Records per tier.
    pub by_tier: BTreeMap<RiskTier, usize>,
}

/// Highest tier the profile runs without a prompt.
fn auto_approve_ceiling(profile: RiskProfile) -> RiskTier {
    match profile {
        RiskProfile::Strict => RiskTier::Safe,
        RiskProfile::Balanced => RiskTier::Low,
        RiskProfile::Permissive => RiskTier::Medium,
    }
}

/// Whether `profile` runs `tier` without a prompt. Critical never is.
pub fn auto_approves(profile: RiskProfile, tier: RiskTier) -> bool {
    tier < RiskTier::Critical && tier <= auto_approve_ceiling(profile)
}

// ─────────────────────────────────────────────────────────────────────────────
// Gate
// ─────────────────────────────────────────────────────────────────────────────

/// Classifies every invocation and decides whether it may run.
pub struct PermissionGate {
    classifier: RiskClassifier,
    handler: Arc<dyn ApprovalHandler>,
    store: DecisionStore,
    profile: RiskProfile,
    scope: AlwaysAllowScope,
    approval_timeout: Duration,
    history_limit: usize,
    history: Mutex<VecDeque<DecisionRecord>>,
    awaiting: Mutex<usize>,
    state: watch::Sender<GateState>,
}

impl PermissionGate {
    /// Create a gate with an in-memory store and the default profile.
    pub fn new(classifier: RiskClassifier, handler: Arc<dyn ApprovalHandler>) -> Self {
        let (state, _) = watch::channel(GateState::Idle);
        Self {
            classifier,
            handler,
            store: DecisionStore::in_memory(),
            profile: RiskProfile::default(),
            scope: AlwaysAllowScope::default(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            history: Mutex::new(VecDeque::new()),
            awaiting: Mutex::new(0),
            state,
        }
    }

    /// Build a gate from the `[pipeline]` and `[security]` sections.
    pub fn from_config(config: &ArbiterConfig, handler: Arc<dyn ApprovalHandler>) -> Result<Self> {
        let pipeline = config.pipeline();
        let security = config.security();
        let classifier = RiskClassifier::from_config(&security)?;
        let store = match security.decision_store_path() {
            Some(path) => DecisionStore::open(path)?,
            None => DecisionStore::in_memory(),
        };
        Ok(Self::new(classifier, handler)
            .with_store(store)
            .with_profile(pipeline.risk_profile)
            .with_scope(security.always_allow_scope)
            .with_approval_timeout(pipeline.approval_timeout())
            .with_history_limit(security.history_limit))
    }

    /// Use `store` for remembered decisions.
    pub fn with_store(mut self, store: DecisionStore) -> Self {
        self.store = store;
        self
    }

    /// Set the risk profile.
    pub fn with_profile(mut self, profile: RiskProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the key scope for remembered decisions.
    pub fn with_scope(mut self, scope: AlwaysAllowScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the approval timeout.
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    /// Set how many decisions the history keeps.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Active risk profile.
    pub fn profile(&self) -> RiskProfile {
        self.profile
    }

    /// Approval timeout.
    pub fn approval_timeout(&self) -> Duration {
        self.approval_timeout
    }

    /// Classify without deciding.
    pub fn classify(&self, descriptor: &ToolDescriptor, args: &Arguments) -> Assessment {
        self.classifier.classify(descriptor, args)
    }

    /// Remembered decisions.
    pub fn store(&self) -> &DecisionStore {
        &self.store
    }

    /// Drop a remembered decision.
    pub fn forget(&self, key: &str) -> Result<bool> {
        self.store.forget(key)
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    /// Decide whether an invocation may run.
    ///
    /// Errors with [`GateError::PermissionDenied`] or
    /// [`GateError::ApprovalTimeout`] when it may not.
    pub async fn authorize(&self, descriptor: &ToolDescriptor, args: &Arguments) -> Result<Authorization> {
        let Assessment { tier, reason } = self.classifier.classify(descriptor, args);
        let capability = descriptor.name.as_str();
        let key = decision_key(descriptor, args, self.scope);

        match self.store.lookup(&key) {
            Some(Remembered::Deny) => {
                tracing::info!(capability = %capability, tier = %tier, "denied by remembered decision");
                self.record(capability, tier, DecisionOutcome::Denied, DecisionSource::Remembered, None);
                return Err(GateError::denied(capability, tier, "denied by a remembered decision"));
            }
            Some(Remembered::Allow) if tier < RiskTier::Critical => {
                tracing::debug!(capability = %capability, tier = %tier, "allowed by remembered decision");
                return Ok(self.allow(capability, tier, reason, DecisionSource::Remembered, None));
            }
            _ => {}
        }

        if auto_approves(self.profile, tier) {
            tracing::trace!(capability = %capability, tier = %tier, profile = ?self.profile, "auto-approved");
            return Ok(self.allow(capability, tier, reason, DecisionSource::Profile, None));
        }

        let request = ApprovalRequest::new(descriptor.clone(), tier, reason.clone(), args);
        tracing::info!(
            capability = %capability,
            tier = %tier,
            request_id = %request.id,
            reason = %reason,
            "awaiting approval"
        );

        let decision = {
            let _awaiting = AwaitingGuard::enter(self);
            tokio::time::timeout(self.approval_timeout, self.handler.request_approval(request)).await
        };

        let Ok(decision) = decision else {
            tracing::warn!(
                capability = %capability,
                tier = %tier,
                timeout_secs = self.approval_timeout.as_secs_f64(),
                "approval timed out, denying"
            );
            self.record(capability, tier, DecisionOutcome::TimedOut, DecisionSource::Prompt, None);
            return Err(GateError::ApprovalTimeout {
                capability: capability.to_string(),
                tier,
                timeout: self.approval_timeout,
            });
        };

        tracing::info!(capability = %capability, tier = %tier, decision = %decision, "approval decided");
        match decision {
            ApprovalDecision::AllowOnce => {
                Ok(self.allow(capability, tier, reason, DecisionSource::Prompt, Some(decision)))
            }
            ApprovalDecision::AllowAlways => {
                if tier == RiskTier::Critical {
                    tracing::info!(capability = %capability, "critical invocation allowed once, not remembered");
                } else {
                    self.remember(&key, Remembered::Allow);
                }
                Ok(self.allow(capability, tier, reason, DecisionSource::Prompt, Some(decision)))
            }
            ApprovalDecision::Deny | ApprovalDecision::DenyAlways => {
                if decision == ApprovalDecision::DenyAlways {
                    self.remember(&key, Remembered::Deny);
                }
                self.record(capability, tier, DecisionOutcome::Denied, DecisionSource::Prompt, Some(decision));
                Err(GateError::denied(capability, tier, format!("denied by user ({})", reason)))
            }
        }
    }

    /// Recent decisions, oldest first.
    pub fn history(&self) -> Vec<DecisionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Counts over the history.
    pub fn summary(&self) -> DecisionSummary {
        let history = self.history.lock();
        let mut summary = DecisionSummary {
            total: history.len(),
            ..Default::default()
        };
        for record in history.iter() {
            match record.outcome {
                DecisionOutcome::Allowed => summary.allowed += 1,
                DecisionOutcome::Denied => summary.denied += 1,
                DecisionOutcome::TimedOut => summary.timed_out += 1,
            }
            *summary.by_tier.entry(record.tier).or_default() += 1;
        }
        summary
    }

    fn allow(
        &self,
        capability: &str,
        tier: RiskTier,
        reason: String,
        source: DecisionSource,
        decision: Option<ApprovalDecision>,
    ) -> Authorization {
        self.record(capability, tier, DecisionOutcome::Allowed, source, decision);
        Authorization {
            capability: capability.to_string(),
            tier,
            reason,
            source,
        }
    }

    fn remember(&self, key: &str, decision: Remembered) {
        // a store failure must not change the answer the user gave
        if let Err(e) = self.store.remember(key, decision) {
            tracing::warn!(key = %key, error = %e, "failed to persist decision");
        }
    }

    fn record(
        &self,
        capability: &str,
        tier: RiskTier,
        outcome: DecisionOutcome,
        source: DecisionSource,
        decision: Option<ApprovalDecision>,
    ) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(DecisionRecord {
            capability: capability.to_string(),
            tier,
            outcome,
            source,
            decision,
            at: Utc::now(),
        });
    }
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("profile", &self.profile)
            .field("scope", &self.scope)
            .field("approval_timeout", &self.approval_timeout)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Holds the gate in `AwaitingApproval`; the last one out moves it to `Resolved`.
struct AwaitingGuard<'a> {
    gate: &'a PermissionGate,
}

impl<'a> AwaitingGuard<'a> {
    fn enter(gate: &'a PermissionGate) -> Self {
        let mut awaiting = gate.awaiting.lock();
        *awaiting += 1;
        gate.state.send_replace(GateState::AwaitingApproval);
        Self { gate }
    }
}

impl Drop for AwaitingGuard<'_> {
    fn drop(&mut self) {
        let mut awaiting = self.gate.awaiting.lock();
        *awaiting = awaiting.saturating_sub(1);
        if *awaiting == 0 {
            self.gate.state.send_replace(GateState::Resolved);
        }
    }
}
