//! The capability catalog.
//!
//! Merges local tools with the tools discovered on every remote server. Remote
//! tools are namespaced as `<server>_<tool>`, filtered by the server's
//! allow-list, and kept in step with server availability: a listener task
//! re-discovers on `Available` and `ToolsChanged` and deregisters on
//! `Unavailable`.
//!
//! Namespacing is not injective (`a` + `b_c` and `a_b` + `c` both give
//! `a_b_c`). The server that registered a name first keeps it; the later
//! server's tool is left out and reported as a collision.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use arbiter_mcp::{
    CallToolResult, ConnectionPool, McpError, ServerEvent, ServerRegistry, ToolContent,
};
use arbiter_types::{Arguments, ToolDescriptor, ToolOrigin, ToolResult};

use crate::error::{Result, ToolError};
use crate::tool::{LocalTools, ToolContext};

const EVENT_BUFFER: usize = 256;

/// A change to the set of remote capabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CatalogEvent {
    /// A capability became available.
    Registered {
        /// The new descriptor.
        descriptor: ToolDescriptor,
    },
    /// A capability's description or schema changed.
    Updated {
        /// The replacement descriptor.
        descriptor: ToolDescriptor,
    },
    /// A capability was removed.
    Deregistered {
        /// Capability name.
        name: String,
        /// Owning server.
        server: String,
    },
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// Server that was queried.
    pub server: String,
    /// Newly registered capability names.
    pub added: Vec<String>,
    /// Capability names no longer advertised.
    pub removed: Vec<String>,
    /// Capability names whose description or schema changed.
    pub changed: Vec<String>,
    /// Advertised tool names hidden by the allow-list.
    pub filtered: Vec<String>,
    /// Capability names already owned by another server, left out.
    pub collisions: Vec<String>,
}

impl DiscoveryReport {
    /// Whether anything changed.
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

struct CatalogInner {
    pool: ConnectionPool,
    registry: Arc<ServerRegistry>,
    local: Arc<dyn LocalTools>,
    /// server → capability name → descriptor
    remote: RwLock<BTreeMap<String, BTreeMap<String, ToolDescriptor>>>,
    events: broadcast::Sender<CatalogEvent>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Local and remote capabilities behind one lookup and one invoke.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ToolCatalog {
    inner: Arc<CatalogInner>,
}

impl ToolCatalog {
    /// Create a catalog over `pool` and the injected local tools.
    pub fn new(pool: ConnectionPool, local: Arc<dyn LocalTools>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(CatalogInner {
                registry: pool.registry().clone(),
                pool,
                local,
                remote: RwLock::new(BTreeMap::new()),
                events,
                cancel: CancellationToken::new(),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Follow server availability events until [`ToolCatalog::shutdown`].
    pub fn start(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let events = self.inner.registry.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        *listener = Some(tokio::spawn(listen(weak, events, cancel)));
    }

    /// Stop the event listener.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener
            && let Err(e) = listener.await
        {
            tracing::warn!(error = %e, "catalog listener ended abnormally");
        }
    }

    /// Subscribe to registration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.inner.events.subscribe()
    }

    /// Query `server` and bring its capabilities up to date.
    pub async fn discover(&self, server: &str) -> Result<DiscoveryReport> {
        self.inner.discover(server).await
    }

    /// Discover every enabled server concurrently.
    pub async fn discover_all(&self) -> Vec<(String, Result<DiscoveryReport>)> {
        let names = self.inner.registry.enabled_names();
        let passes = names.iter().map(|name| self.inner.discover(name));
        let results = futures::future::join_all(passes).await;
        names.into_iter().zip(results).collect()
    }

    /// Remove every capability of `server`. Returns the removed names.
    pub fn deregister_server(&self, server: &str) -> Vec<String> {
        self.inner.deregister_server(server)
    }

    /// Descriptor for `name`. Local tools shadow remote ones.
    pub fn lookup(&self, name: &str) -> Option<ToolDescriptor> {
        if let Some(descriptor) = self.inner.local.lookup(name) {
            return Some(descriptor);
        }
        self.inner
            .remote
            .read()
            .values()
            .find_map(|tools| tools.get(name).cloned())
    }

    /// Every capability, sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut all = self.inner.local.descriptors();
        let remote = self.inner.remote.read();
        all.extend(
            remote
                .values()
                .flat_map(|tools| tools.values())
                .filter(|d| self.inner.local.lookup(&d.name).is_none())
                .cloned(),
        );
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Capabilities of one server, sorted by name.
    pub fn server_tools(&self, server: &str) -> Vec<ToolDescriptor> {
        self.inner
            .remote
            .read()
            .get(server)
            .map(|tools| tools.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Run a capability.
    ///
    /// Remote capabilities of a failed or disabled server fail fast with
    /// [`ToolError::Unavailable`]. Both origins yield the same
    /// [`ToolResult`] shape.
    pub async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        args: Arguments,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        let name = descriptor.name.as_str();
        let run = async {
            match &descriptor.origin {
                ToolOrigin::Local => self.inner.local.invoke(name, args, ctx).await,
                ToolOrigin::Remote { server, tool } => {
                    self.inner.invoke_remote(name, server, tool, args, ctx).await
                }
            }
        };

        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                tracing::debug!(capability = %name, "invocation cancelled");
                Err(ToolError::Cancelled(name.to_string()))
            }
            result = run => result,
        }
    }

    /// Re-enable `server` and discover its tools.
    pub async fn enable_server(&self, server: &str) -> Result<DiscoveryReport> {
        self.inner.registry.set_enabled(server, true)?;
        self.inner.discover(server).await
    }

    /// Disable `server`, close its connection and deregister its tools.
    pub async fn disable_server(&self, server: &str) -> Result<Vec<String>> {
        self.inner.registry.set_enabled(server, false)?;
        self.inner.pool.disconnect(server).await;
        Ok(self.inner.deregister_server(server))
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let remote = self.inner.remote.read();
        f.debug_struct("ToolCatalog")
            .field("servers", &remote.keys().collect::<Vec<_>>())
            .field("remote_tools", &remote.values().map(BTreeMap::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

impl CatalogInner {
    async fn discover(&self, server: &str) -> Result<DiscoveryReport> {
        let descriptor = self.registry.require(server)?;
        let tools = self.pool.list_tools(server).await?;

        let mut report = DiscoveryReport {
            server: server.to_string(),
            ..Default::default()
        };
        let mut fresh = BTreeMap::new();
        for info in tools {
            if !descriptor.allows_tool(&info.name) {
                report.filtered.push(info.name);
                continue;
            }
            let read_only = descriptor.declares_read_only(&info.name);
            let mut tool =
                ToolDescriptor::remote(server, info.name, info.description, info.input_schema);
            if read_only {
                tool = tool.declared_read_only();
            }
            fresh.insert(tool.name.clone(), tool);
        }

        let mut events = Vec::new();
        let gone = {
            let mut remote = self.remote.write();
            let previous = remote.remove(server).unwrap_or_default();

            // the server may have failed or been disabled while listing
            let gone = if !self.registry.is_enabled(server) {
                Some(McpError::Disabled(server.to_string()))
            } else if self.registry.is_failed(server) {
                Some(McpError::connection(server, "failed during discovery"))
            } else {
                None
            };
            if gone.is_some() {
                fresh.clear();
            }

            fresh.retain(|name, _| {
                let owner = remote
                    .iter()
                    .find(|(_, tools)| tools.contains_key(name))
                    .map(|(owner, _)| owner.as_str());
                match owner {
                    Some(owner) => {
                        tracing::warn!(
                            server = %server,
                            capability = %name,
                            owner = %owner,
                            "capability name already registered by another server"
                        );
                        report.collisions.push(name.clone());
                        false
                    }
                    None => true,
                }
            });

            for (name, tool) in &fresh {
                match previous.get(name) {
                    None => {
                        report.added.push(name.clone());
                        events.push(CatalogEvent::Registered {
                            descriptor: tool.clone(),
                        });
                    }
                    Some(old) if old != tool => {
                        report.changed.push(name.clone());
                        events.push(CatalogEvent::Updated {
                            descriptor: tool.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
            for name in previous.keys().filter(|name| !fresh.contains_key(*name)) {
                report.removed.push(name.clone());
                events.push(CatalogEvent::Deregistered {
                    name: name.clone(),
                    server: server.to_string(),
                });
            }
            if gone.is_none() {
                remote.insert(server.to_string(), fresh);
            }
            gone
        };

        for event in events {
            let _ = self.events.send(event);
        }
        if let Some(e) = gone {
            tracing::info!(server = %server, removed = report.removed.len(), error = %e, "discovery discarded");
            return Err(e.into());
        }

        tracing::info!(
            server = %server,
            added = report.added.len(),
            removed = report.removed.len(),
            changed = report.changed.len(),
            filtered = report.filtered.len(),
            collisions = report.collisions.len(),
            "tools discovered"
        );
        Ok(report)
    }

    fn deregister_server(&self, server: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .remote
            .write()
            .remove(server)
            .map(|tools| tools.into_keys().collect())
            .unwrap_or_default();
        if !removed.is_empty() {
            tracing::info!(server = %server, count = removed.len(), "tools deregistered");
        }
        for name in &removed {
            let _ = self.events.send(CatalogEvent::Deregistered {
                name: name.clone(),
                server: server.to_string(),
            });
        }
        removed
    }

    async fn invoke_remote(
        &self,
        capability: &str,
        server: &str,
        tool: &str,
        args: Arguments,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        if !self.registry.contains(server) {
            return Err(ToolError::unavailable(capability, server, "is not configured"));
        }
        if !self.registry.is_enabled(server) {
            return Err(ToolError::unavailable(capability, server, "is disabled"));
        }
        if self.registry.is_failed(server) {
            return Err(ToolError::unavailable(capability, server, "has failed"));
        }

        tracing::debug!(server = %server, tool = %tool, "calling remote tool");
        let result = self
            .pool
            .call_tool(server, tool, Value::Object(args), ctx.timeout)
            .await
            .inspect_err(|e| {
                tracing::warn!(server = %server, tool = %tool, error = %e, "remote tool call failed");
            })?;
        Ok(convert_result(result))
    }
}

async fn listen(
    catalog: Weak<CatalogInner>,
    mut events: broadcast::Receiver<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "catalog listener lagged behind server events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(catalog) = catalog.upgrade() else {
            break;
        };

        match event {
            ServerEvent::Available { server } | ServerEvent::ToolsChanged { server } => {
                if let Err(e) = catalog.discover(&server).await {
                    tracing::warn!(server = %server, error = %e, "re-discovery failed");
                }
            }
            ServerEvent::Unavailable { server, reason } => {
                tracing::info!(server = %server, reason = %reason, "server unavailable");
                catalog.deregister_server(&server);
            }
        }
    }
    tracing::debug!("catalog listener stopped");
}

/// Normalize a remote result into the shape local tools return.
fn convert_result(result: CallToolResult) -> ToolResult {
    if result.is_error() {
        let message = result
            .joined_text()
            .unwrap_or_else(|| "remote tool reported an error".to_string());
        return ToolResult::error(message);
    }

    let parts: Vec<String> = result
        .content
        .into_iter()
        .map(|content| match content {
            ToolContent::Text { text } => text,
            ToolContent::Image { mime_type, .. } => format!("[image: {}]", mime_type),
            ToolContent::Resource {
                text: Some(text), ..
            } => text,
            ToolContent::Resource { uri, .. } => format!("[resource: {}]", uri),
        })
        .collect();
    ToolResult::text(parts.join("\n"))
}
