//! The caller-facing invocation pipeline.
//!
//! ```text
//! invoke(name, args)
//!   → catalog lookup          (ToolNotFound)
//!   → permission gate         (PermissionDenied / ApprovalTimeout)
//!   → catalog invoke          (ToolUnavailable / remote errors)
//!   → Invocation { capability, tier, result }
//! ```

use std::sync::Arc;

use serde::Serialize;

use arbiter_config::ArbiterConfig;
use arbiter_gate::{ApprovalHandler, PermissionGate, RiskTier};
use arbiter_mcp::{
    ConnectionPool, Connector, DefaultConnector, HealthMonitor, ServerRegistry, ServerStatus,
};
use arbiter_types::{Arguments, ToolDescriptor, ToolResult};

use crate::catalog::{DiscoveryReport, ToolCatalog};
use crate::error::{Result, ToolError};
use crate::tool::{LocalTools, ToolContext};

/// A completed invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation {
    /// Capability that ran.
    pub capability: String,
    /// Tier it was authorized at.
    pub tier: RiskTier,
    /// What it returned.
    pub result: ToolResult,
}

/// Registry, pool, catalog, gate and health monitors, started together and
/// shut down together.
pub struct ToolPipeline {
    enabled: bool,
    registry: Arc<ServerRegistry>,
    pool: ConnectionPool,
    catalog: ToolCatalog,
    gate: PermissionGate,
    monitor: HealthMonitor,
}

impl ToolPipeline {
    /// Start over real transports.
    pub async fn start(
        config: &ArbiterConfig,
        local: Arc<dyn LocalTools>,
        approvals: Arc<dyn ApprovalHandler>,
    ) -> Result<Self> {
        Self::start_with_connector(config, local, approvals, Arc::new(DefaultConnector)).await
    }

    /// Start with a custom connector.
    ///
    /// When `pipeline.enabled` is false no servers are registered and only
    /// local tools are exposed.
    pub async fn start_with_connector(
        config: &ArbiterConfig,
        local: Arc<dyn LocalTools>,
        approvals: Arc<dyn ApprovalHandler>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let settings = config.pipeline();

        let gate = PermissionGate::from_config(config, approvals)?;
        let registry = if settings.enabled {
            Arc::new(ServerRegistry::from_config(config))
        } else {
            tracing::info!("remote tools disabled, exposing local tools only");
            Arc::new(ServerRegistry::new([]))
        };
        let pool = ConnectionPool::new(registry.clone(), connector, settings.max_concurrent_calls);
        let catalog = ToolCatalog::new(pool.clone(), local);
        let monitor = HealthMonitor::new(pool.clone(), &config.health());

        let pipeline = Self {
            enabled: settings.enabled,
            registry,
            pool,
            catalog,
            gate,
            monitor,
        };

        if pipeline.enabled {
            pipeline.catalog.start();
            if settings.auto_discover {
                for (server, outcome) in pipeline.catalog.discover_all().await {
                    if let Err(e) = outcome {
                        tracing::warn!(server = %server, error = %e, "initial discovery failed");
                    }
                }
            }
            pipeline.monitor.start();
        }

        tracing::info!(
            servers = pipeline.registry.names().len(),
            capabilities = pipeline.catalog.list().len(),
            profile = ?pipeline.gate.profile(),
            "tool pipeline started"
        );
        Ok(pipeline)
    }

    /// Whether remote servers are in use.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Invoke a capability by name.
    pub async fn invoke(&self, name: &str, args: Arguments) -> Result<Invocation> {
        self.invoke_with(name, args, &ToolContext::new()).await
    }

    /// Invoke a capability by name; cancelling `ctx` aborts the approval wait
    /// or the call.
    pub async fn invoke_with(&self, name: &str, args: Arguments, ctx: &ToolContext) -> Result<Invocation> {
        let descriptor = self
            .catalog
            .lookup(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let authorization = tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return Err(ToolError::Cancelled(name.to_string()));
            }
            authorization = self.gate.authorize(&descriptor, &args) => authorization?,
        };

        let result = self.catalog.invoke(&descriptor, args, ctx).await?;
        tracing::debug!(
            capability = %name,
            tier = %authorization.tier,
            success = result.is_success(),
            "invocation finished"
        );
        Ok(Invocation {
            capability: descriptor.name,
            tier: authorization.tier,
            result,
        })
    }

    /// Every capability, sorted by name.
    pub fn list_capabilities(&self) -> Vec<ToolDescriptor> {
        self.catalog.list()
    }

    /// Status of every configured server.
    pub fn servers(&self) -> Vec<ServerStatus> {
        self.registry.statuses()
    }

    /// Re-run discovery on every enabled server.
    pub async fn refresh(&self) -> Vec<(String, Result<DiscoveryReport>)> {
        self.catalog.discover_all().await
    }

    /// Re-enable a server and discover its tools.
    pub async fn enable_server(&self, server: &str) -> Result<DiscoveryReport> {
        self.catalog.enable_server(server).await
    }

    /// Disable a server and deregister its tools.
    pub async fn disable_server(&self, server: &str) -> Result<Vec<String>> {
        self.catalog.disable_server(server).await
    }

    /// The capability catalog.
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// The permission gate.
    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// The server registry.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The health monitor.
    pub fn health(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Stop monitors and the catalog listener, then close every connection.
    pub async fn shutdown(&self) {
        self.monitor.shutdown().await;
        self.catalog.shutdown().await;
        self.pool.shutdown().await;
        tracing::info!("tool pipeline shut down");
    }
}

impl std::fmt::Debug for ToolPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolPipeline")
            .field("enabled", &self.enabled)
            .field("registry", &self.registry)
            .field("catalog", &self.catalog)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
