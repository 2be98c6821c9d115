//! Configured servers, their live status, and the availability event bus.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use arbiter_config::ArbiterConfig;

use crate::connection::ConnectionState;
use crate::error::{McpError, Result};
use crate::server::ServerDescriptor;

const EVENT_BUFFER: usize = 128;

/// Availability transitions published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The server came back after being unavailable.
    Available {
        /// Server name.
        server: String,
    },
    /// The server failed or was disabled.
    Unavailable {
        /// Server name.
        server: String,
        /// Why it became unavailable.
        reason: String,
    },
    /// The server announced a changed tool list.
    ToolsChanged {
        /// Server name.
        server: String,
    },
}

impl ServerEvent {
    /// Server the event concerns.
    pub fn server(&self) -> &str {
        match self {
            Self::Available { server }
            | Self::Unavailable { server, .. }
            | Self::ToolsChanged { server } => server,
        }
    }
}

/// Point-in-time status of one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    /// Server name.
    pub name: String,
    /// Connection target as displayed to users.
    pub target: String,
    /// Whether the server is in use.
    pub enabled: bool,
    /// Current state.
    pub state: ConnectionState,
    /// Last successful handshake or probe.
    pub last_seen: Option<DateTime<Utc>>,
    /// Failed probes or connection cycles since the last success.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
}

struct Entry {
    descriptor: ServerDescriptor,
    status: ServerStatus,
    /// An `Unavailable` event is outstanding.
    announced_down: bool,
}

/// Registry of configured servers.
///
/// Descriptors are fixed after load except for the enabled flag. All status
/// mutation goes through the methods below, which publish [`ServerEvent`]s
/// after releasing the lock.
pub struct ServerRegistry {
    servers: RwLock<BTreeMap<String, Entry>>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerRegistry {
    /// Create a registry from descriptors. Later duplicates replace earlier ones.
    pub fn new(descriptors: impl IntoIterator<Item = ServerDescriptor>) -> Self {
        let servers = descriptors
            .into_iter()
            .map(|descriptor| {
                let status = ServerStatus {
                    name: descriptor.name.clone(),
                    target: descriptor.target.to_string(),
                    enabled: descriptor.enabled,
                    state: ConnectionState::Disconnected,
                    last_seen: None,
                    consecutive_failures: 0,
                    last_error: None,
                };
                let entry = Entry {
                    descriptor,
                    status,
                    announced_down: false,
                };
                (entry.descriptor.name.clone(), entry)
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            servers: RwLock::new(servers),
            events,
        }
    }

    /// Create a registry from the `[[servers]]` table.
    pub fn from_config(config: &ArbiterConfig) -> Self {
        Self::new(config.servers.iter().map(ServerDescriptor::from))
    }

    /// Descriptor snapshot for `name`.
    pub fn descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        self.servers.read().get(name).map(|e| e.descriptor.clone())
    }

    /// Descriptor snapshot, or `UnknownServer`.
    pub fn require(&self, name: &str) -> Result<ServerDescriptor> {
        self.descriptor(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()))
    }

    /// All server names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    /// Names of enabled servers, sorted.
    pub fn enabled_names(&self) -> Vec<String> {
        self.servers
            .read()
            .values()
            .filter(|e| e.descriptor.enabled)
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.servers.read().contains_key(name)
    }

    /// Whether `name` is registered and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.servers
            .read()
            .get(name)
            .is_some_and(|e| e.descriptor.enabled)
    }

    /// Current state of `name`.
    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.servers.read().get(name).map(|e| e.status.state)
    }

    /// Whether `name` is in the `Failed` state.
    pub fn is_failed(&self, name: &str) -> bool {
        self.state(name) == Some(ConnectionState::Failed)
    }

    /// Status snapshot for `name`.
    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        self.servers.read().get(name).map(|e| e.status.clone())
    }

    /// Status snapshots for every server, sorted by name.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.servers
            .read()
            .values()
            .map(|e| e.status.clone())
            .collect()
    }

    /// Subscribe to availability events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Availability events from this point on, as a stream.
    pub fn events(&self) -> impl Stream<Item = ServerEvent> + Send + 'static {
        let mut rx = self.events.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "server event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    fn publish(&self, event: Option<ServerEvent>) {
        if let Some(event) = event {
            tracing::debug!(server = %event.server(), event = ?event, "server event");
            let _ = self.events.send(event);
        }
    }

    /// Move `name` to `state` without touching counters. Returns the previous state.
    pub fn set_state(&self, name: &str, state: ConnectionState) -> Option<ConnectionState> {
        let mut servers = self.servers.write();
        let entry = servers.get_mut(name)?;
        let previous = entry.status.state;
        if previous != state {
            tracing::debug!(server = %name, from = %previous, to = %state, "state transition");
            entry.status.state = state;
        }
        Some(previous)
    }

    /// Record a successful handshake or probe and move to `Connected`.
    ///
    /// Publishes `Available` when the server had been announced unavailable.
    /// Returns the previous state.
    pub fn mark_connected(&self, name: &str) -> Option<ConnectionState> {
        let (previous, event) = {
            let mut servers = self.servers.write();
            let entry = servers.get_mut(name)?;
            let previous = entry.status.state;
            entry.status.state = ConnectionState::Connected;
            entry.status.last_seen = Some(Utc::now());
            entry.status.consecutive_failures = 0;
            entry.status.last_error = None;
            let event = std::mem::take(&mut entry.announced_down).then(|| ServerEvent::Available {
                server: name.to_string(),
            });
            (previous, event)
        };
        if previous != ConnectionState::Connected {
            tracing::info!(server = %name, from = %previous, "server connected");
        }
        self.publish(event);
        Some(previous)
    }

    /// Count a failed probe or connection cycle. Returns the new consecutive count.
    pub fn record_failure(&self, name: &str, error: &str) -> u32 {
        let mut servers = self.servers.write();
        let Some(entry) = servers.get_mut(name) else {
            return 0;
        };
        entry.status.consecutive_failures = entry.status.consecutive_failures.saturating_add(1);
        entry.status.last_error = Some(error.to_string());
        entry.status.consecutive_failures
    }

    /// Move `name` to `Failed`, publishing `Unavailable` once per outage.
    pub fn mark_failed(&self, name: &str, reason: &str) {
        let event = {
            let mut servers = self.servers.write();
            let Some(entry) = servers.get_mut(name) else {
                return;
            };
            entry.status.state = ConnectionState::Failed;
            entry.status.last_error = Some(reason.to_string());
            (!std::mem::replace(&mut entry.announced_down, true)).then(|| {
                ServerEvent::Unavailable {
                    server: name.to_string(),
                    reason: reason.to_string(),
                }
            })
        };
        tracing::warn!(server = %name, reason = %reason, "server failed");
        self.publish(event);
    }

    /// Publish `ToolsChanged` for `name`.
    pub fn notify_tools_changed(&self, name: &str) {
        if self.contains(name) {
            self.publish(Some(ServerEvent::ToolsChanged {
                server: name.to_string(),
            }));
        }
    }

    /// Enable or disable `name` at runtime. Returns the previous flag.
    ///
    /// Disabling moves the server to `Disconnected` and publishes `Unavailable`.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let (previous, event) = {
            let mut servers = self.servers.write();
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| McpError::UnknownServer(name.to_string()))?;
            let previous = entry.descriptor.enabled;
            entry.descriptor.enabled = enabled;
            entry.status.enabled = enabled;
            let event = if previous && !enabled {
                entry.status.state = ConnectionState::Disconnected;
                (!std::mem::replace(&mut entry.announced_down, true)).then(|| {
                    ServerEvent::Unavailable {
                        server: name.to_string(),
                        reason: "disabled".to_string(),
                    }
                })
            } else {
                None
            };
            (previous, event)
        };
        if previous != enabled {
            tracing::info!(server = %name, enabled, "server enabled flag changed");
        }
        self.publish(event);
        Ok(previous)
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.names())
            .finish()
    }
}
