//! Connection pool: at most one live connection per server, with retry.
//!
//! Concurrent `ensure_connected` calls for the same server share one in-flight
//! attempt. The attempt future is stored in the slot map and every caller
//! awaits a clone of it, so only one transport is ever opened per cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::connection::{Connection, ConnectionState};
use crate::error::{McpError, Result};
use crate::protocol::{CallToolResult, ToolInfo, methods};
use crate::registry::ServerRegistry;
use crate::server::ServerDescriptor;
use crate::transport::Connector;

type Attempt = Shared<BoxFuture<'static, Result<Arc<Connection>>>>;

enum Slot {
    Ready(Arc<Connection>),
    Pending { generation: u64, attempt: Attempt },
}

/// How an attempt reports to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Full retry budget; the registry follows the outcome.
    Establish,
    /// One attempt for a health probe; the monitor owns the transitions.
    Probe,
}

struct PoolInner {
    registry: Arc<ServerRegistry>,
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
    admission: Arc<Semaphore>,
    max_concurrent: usize,
}

/// Pool of server connections shared by the catalog and the health monitor.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool admitting at most `max_concurrent_calls` in-flight tool calls.
    pub fn new(
        registry: Arc<ServerRegistry>,
        connector: Arc<dyn Connector>,
        max_concurrent_calls: usize,
    ) -> Self {
        let max_concurrent = max_concurrent_calls.max(1);
        Self {
            inner: Arc::new(PoolInner {
                registry,
                connector,
                slots: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                admission: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
            }),
        }
    }

    /// Registry backing this pool.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.inner.registry
    }

    /// Admission slots not currently held by a call.
    pub fn available_permits(&self) -> usize {
        self.inner.admission.available_permits()
    }

    /// Configured admission bound.
    pub fn max_concurrent_calls(&self) -> usize {
        self.inner.max_concurrent
    }

    /// The live connection for `server`, if any.
    pub fn connection(&self, server: &str) -> Option<Arc<Connection>> {
        match self.inner.slots.lock().get(server) {
            Some(Slot::Ready(conn)) if conn.is_connected() => Some(conn.clone()),
            _ => None,
        }
    }

    /// Return the live connection for `server`, establishing one if needed.
    ///
    /// Retries with the server's backoff; when every attempt fails the server
    /// is marked `Failed` and `ServerUnavailable` is returned.
    pub async fn ensure_connected(&self, server: &str) -> Result<Arc<Connection>> {
        let descriptor = self.inner.registry.require(server)?;
        if !descriptor.enabled {
            return Err(McpError::Disabled(server.to_string()));
        }
        self.attempt(descriptor, Mode::Establish).await
    }

    fn attempt(&self, descriptor: ServerDescriptor, mode: Mode) -> Attempt {
        let mut slots = self.inner.slots.lock();
        match slots.get(&descriptor.name) {
            Some(Slot::Ready(conn)) if conn.is_connected() => {
                let conn = conn.clone();
                return futures::future::ready(Ok(conn)).boxed().shared();
            }
            Some(Slot::Pending { attempt, .. }) => return attempt.clone(),
            _ => {}
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let name = descriptor.name.clone();
        let attempt = self
            .inner
            .clone()
            .establish(descriptor, generation, mode)
            .boxed()
            .shared();
        slots.insert(
            name,
            Slot::Pending {
                generation,
                attempt: attempt.clone(),
            },
        );
        attempt
    }

    /// Call a tool, reconnecting and retrying once if the connection drops mid-call.
    ///
    /// Waits for an admission slot first; slots are granted in FIFO order.
    /// `timeout` defaults to the server's configured timeout.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let _permit = self.admit(server).await?;
        let conn = self.ensure_connected(server).await?;
        let timeout = timeout.unwrap_or(conn.default_timeout());

        match conn.call_tool(tool, arguments.clone(), timeout).await {
            Err(e) if e.is_connection_lost() => {
                tracing::warn!(server = %server, tool = %tool, "connection lost mid-call, reconnecting once");
                self.discard(server, &conn);
                let conn = self.ensure_connected(server).await?;
                conn.call_tool(tool, arguments, timeout).await
            }
            outcome => outcome,
        }
    }

    /// Query the tool catalog of `server`.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolInfo>> {
        let conn = self.ensure_connected(server).await?;
        conn.list_tools(conn.default_timeout()).await
    }

    /// Liveness probe used by the health monitor.
    ///
    /// Pings the live connection, or makes a single connection attempt first
    /// when there is none. Never changes registry state.
    pub async fn probe(&self, server: &str, timeout: Duration) -> Result<()> {
        let conn = match self.connection(server) {
            Some(conn) => conn,
            None => {
                let descriptor = self.inner.registry.require(server)?;
                let descriptor = ServerDescriptor {
                    timeout: descriptor.timeout.min(timeout),
                    ..descriptor
                };
                self.attempt(descriptor, Mode::Probe).await?
            }
        };
        conn.ping(timeout).await
    }

    /// Close and forget the connection to `server`.
    pub async fn disconnect(&self, server: &str) {
        let slot = self.inner.slots.lock().remove(server);
        if let Some(Slot::Ready(conn)) = slot {
            tracing::debug!(server = %server, "disconnecting");
            conn.close().await;
        }
    }

    /// Close every connection and refuse further calls.
    pub async fn shutdown(&self) {
        self.inner.admission.close();
        let slots: Vec<(String, Slot)> = self.inner.slots.lock().drain().collect();
        for (name, slot) in slots {
            if let Slot::Ready(conn) = slot {
                conn.close().await;
            }
            if self.inner.registry.state(&name) != Some(ConnectionState::Failed) {
                self.inner
                    .registry
                    .set_state(&name, ConnectionState::Disconnected);
            }
        }
        tracing::info!("connection pool shut down");
    }

    async fn admit(&self, server: &str) -> Result<OwnedSemaphorePermit> {
        self.inner
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| McpError::connection(server, "connection pool is shut down"))
    }

    fn discard(&self, server: &str, conn: &Arc<Connection>) {
        let mut slots = self.inner.slots.lock();
        if matches!(slots.get(server), Some(Slot::Ready(current)) if Arc::ptr_eq(current, conn)) {
            slots.remove(server);
        }
    }
}

impl PoolInner {
    async fn establish(
        self: Arc<Self>,
        descriptor: ServerDescriptor,
        generation: u64,
        mode: Mode,
    ) -> Result<Arc<Connection>> {
        let name = descriptor.name.clone();
        let attempts = match mode {
            Mode::Establish => descriptor.max_attempts(),
            Mode::Probe => 1,
        };

        if mode == Mode::Establish {
            let seen_before = self
                .registry
                .status(&name)
                .is_some_and(|s| s.last_seen.is_some());
            let state = if seen_before {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
            self.registry.set_state(&name, state);
        }

        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = descriptor.backoff.delay(attempt - 1);
                tracing::debug!(server = %name, attempt, delay_ms = delay.as_millis() as u64, "retrying connection");
                tokio::time::sleep(delay).await;
            }
            match Connection::open(&descriptor, self.connector.as_ref()).await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    self.install(&name, generation, Some(conn.clone()));
                    spawn_watcher(Arc::downgrade(&self), &conn);
                    if mode == Mode::Establish {
                        self.registry.mark_connected(&name);
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::warn!(server = %name, attempt, attempts, error = %e, "connection attempt failed");
                    last_error = Some(e);
                }
            }
        }

        self.install(&name, generation, None);
        let last_error = last_error.map(|e| e.to_string()).unwrap_or_default();
        if mode == Mode::Establish {
            self.registry.record_failure(&name, &last_error);
            self.registry.mark_failed(&name, &last_error);
        }
        Err(McpError::ServerUnavailable {
            server: name,
            attempts,
            last_error,
        })
    }

    /// Replace the pending slot from `generation` with its outcome.
    fn install(&self, name: &str, generation: u64, conn: Option<Arc<Connection>>) {
        let mut slots = self.slots.lock();
        let current = matches!(
            slots.get(name),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );
        if !current {
            return;
        }
        match conn {
            Some(conn) => {
                slots.insert(name.to_string(), Slot::Ready(conn));
            }
            None => {
                slots.remove(name);
            }
        }
    }

    /// Forget `conn` after its transport closed.
    fn forget(&self, name: &str, conn: &Weak<Connection>) {
        let removed = {
            let mut slots = self.slots.lock();
            let is_current = matches!(
                slots.get(name),
                Some(Slot::Ready(current)) if Weak::ptr_eq(&Arc::downgrade(current), conn)
            );
            is_current && slots.remove(name).is_some()
        };
        if removed && self.registry.state(name) == Some(ConnectionState::Connected) {
            self.registry
                .set_state(name, ConnectionState::Disconnected);
        }
    }
}

/// Forward tool-list changes to the registry and clean up after the transport closes.
fn spawn_watcher(pool: Weak<PoolInner>, conn: &Arc<Connection>) {
    let name = conn.server().to_string();
    let weak_conn = Arc::downgrade(conn);
    let mut notifications = Box::pin(conn.notifications());
    tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            if notification.method == methods::TOOLS_CHANGED
                && let Some(pool) = pool.upgrade()
            {
                pool.registry.notify_tools_changed(&name);
            }
        }
        if let Some(pool) = pool.upgrade() {
            pool.forget(&name, &weak_conn);
        }
    });
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("servers", &self.inner.slots.lock().len())
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish()
    }
}
