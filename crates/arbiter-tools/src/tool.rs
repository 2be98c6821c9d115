//! Local tools.
//!
//! In-process capabilities implement [`Tool`] and live in a [`ToolRegistry`].
//! The catalog reaches them only through the [`LocalTools`] seam, so any
//! registry can be injected.
//!
//! # Example
//!
//! ```rust,ignore
//! use arbiter_tools::{Tool, ToolContext, ToolRegistry};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Tool for Echo {
//!     fn name(&self) -> &str { "echo" }
//!     fn description(&self) -> &str { "Echo the message back" }
//!     fn parameters(&self) -> Value { json!({"type": "object"}) }
//!     fn category(&self) -> ToolCategory { ToolCategory::ReadOnly }
//!
//!     async fn execute(&self, args: Arguments, _ctx: &ToolContext) -> Result<ToolResult> {
//!         Ok(ToolResult::text(args["message"].to_string()))
//!     }
//! }
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(Echo);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use arbiter_types::{Arguments, ToolCategory, ToolDescriptor, ToolResult};

use crate::error::{Result, ToolError};

// ─────────────────────────────────────────────────────────────────────────────
// Tool Trait
// ─────────────────────────────────────────────────────────────────────────────

/// An in-process capability.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments.
    fn parameters(&self) -> Value;

    /// What the tool does, for risk classification.
    fn category(&self) -> ToolCategory {
        ToolCategory::Unclassified
    }

    /// Run the tool.
    ///
    /// Return `Ok(ToolResult::Error { .. })` for failures the caller should
    /// see as tool output, and `Err` only when the tool could not run. The
    /// registry reports any `Err` other than cancellation as
    /// [`ToolError::Execution`].
    async fn execute(&self, args: Arguments, ctx: &ToolContext) -> Result<ToolResult>;

    /// Descriptor used by the gate and the catalog.
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::local(self.name(), self.description(), self.parameters(), self.category())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool Context
// ─────────────────────────────────────────────────────────────────────────────

/// Per-invocation context.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Cancelled when the caller gives up.
    pub cancellation: CancellationToken,
    /// Overrides the server's call timeout for remote tools.
    pub timeout: Option<Duration>,
}

impl ToolContext {
    /// Context with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context tied to an existing cancellation token.
    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            timeout: None,
        }
    }

    /// Set the call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the caller has cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local registry seam
// ─────────────────────────────────────────────────────────────────────────────

/// Lookup and invocation of in-process tools.
#[async_trait]
pub trait LocalTools: Send + Sync {
    /// Descriptor for `name`.
    fn lookup(&self, name: &str) -> Option<ToolDescriptor>;

    /// Every local descriptor.
    fn descriptors(&self) -> Vec<ToolDescriptor>;

    /// Run the tool called `name`.
    async fn invoke(&self, name: &str, args: Arguments, ctx: &ToolContext) -> Result<ToolResult>;
}

/// Registry of in-process tools.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "replaced local tool");
        }
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl LocalTools for ToolRegistry {
    fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|tool| tool.descriptor())
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|tool| tool.descriptor()).collect()
    }

    async fn invoke(&self, name: &str, args: Arguments, ctx: &ToolContext) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(args, ctx).await.map_err(|e| match e {
            ToolError::Cancelled(_) | ToolError::Execution { .. } => e,
            other => {
                tracing::warn!(tool = %name, error = %other, "local tool failed");
                ToolError::execution(name, other.to_string())
            }
        })
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock Tool (for testing)
// ─────────────────────────────────────────────────────────────────────────────

/// A local tool that records its calls and returns a fixed result.
#[cfg(test)]
#[derive(Debug)]
pub struct MockTool {
    name: String,
    category: ToolCategory,
    response: ToolResult,
    calls: parking_lot::Mutex<Vec<Arguments>>,
}

#[cfg(test)]
impl MockTool {
    pub fn new(name: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            name: name.into(),
            category,
            response: ToolResult::text("mock response"),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(mut self, response: ToolResult) -> Self {
        self.response = response;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "A mock tool for testing"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn category(&self) -> ToolCategory {
        self.category
    }

    async fn execute(&self, args: Arguments, _ctx: &ToolContext) -> Result<ToolResult> {
        self.calls.lock().push(args);
        Ok(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_types::ToolOrigin;

    #[test]
    fn test_registry_basics() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(MockTool::new("think", ToolCategory::ReadOnly));
        registry.register(MockTool::new("bash", ToolCategory::Execute));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["bash", "think"]);
        assert!(registry.contains("bash"));

        let descriptor = registry.lookup("bash").unwrap();
        assert_eq!(descriptor.category, ToolCategory::Execute);
        assert_eq!(descriptor.origin, ToolOrigin::Local);
        assert!(registry.lookup("nope").is_none());
    }

    #[tokio::test]
    async fn test_invoke() {
        let mut registry = ToolRegistry::new();
        let tool = Arc::new(
            MockTool::new("think", ToolCategory::ReadOnly).with_response(ToolResult::text("hmm")),
        );
        registry.register_arc(tool.clone());

        let result = registry
            .invoke("think", Arguments::new(), &ToolContext::new())
            .await
            .unwrap();
        assert_eq!(result, ToolResult::text("hmm"));
        assert_eq!(tool.call_count(), 1);

        let err = registry
            .invoke("missing", Arguments::new(), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));
    }

    /// Fails with a nested lookup error, or as cancelled.
    struct Broken {
        cancelled: bool,
    }

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameters(&self) -> Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, _args: Arguments, _ctx: &ToolContext) -> Result<ToolResult> {
            if self.cancelled {
                return Err(ToolError::Cancelled("broken".into()));
            }
            Err(ToolError::NotFound("helper".into()))
        }
    }

    #[tokio::test]
    async fn test_local_failure_becomes_execution_error() {
        let mut registry = ToolRegistry::new();
        registry.register(Broken { cancelled: false });

        let err = registry
            .invoke("broken", Arguments::new(), &ToolContext::new())
            .await
            .unwrap_err();
        match err {
            ToolError::Execution {
                ref capability,
                ref message,
            } => {
                assert_eq!(capability, "broken");
                assert!(message.contains("helper"));
            }
            other => panic!("expected execution error, got {:?}", other),
        }
        assert_eq!(err.kind(), arbiter_types::ErrorKind::Internal);
        assert!(err.to_string().starts_with("tool 'broken' failed"));

        let mut registry = ToolRegistry::new();
        registry.register(Broken { cancelled: true });
        let err = registry
            .invoke("broken", Arguments::new(), &ToolContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled(_)));
    }

    #[test]
    fn test_context() {
        let token = CancellationToken::new();
        let ctx = ToolContext::with_cancellation(token.clone()).with_timeout(Duration::from_secs(2));
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.timeout, Some(Duration::from_secs(2)));
    }
}
