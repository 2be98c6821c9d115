//! Periodic liveness probes, one background task per server.
//!
//! Probe failures never reach callers. They are counted in the registry, and
//! once a server reaches the failure threshold it is marked `Failed` and its
//! connection is closed. The next successful probe brings it back, which
//! publishes `Available` and so triggers re-discovery.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use arbiter_config::HealthConfig;

use crate::connection::ConnectionState;
use crate::pool::ConnectionPool;
use crate::registry::ServerRegistry;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Server answered and was already healthy.
    Healthy,
    /// Server answered after having been `Failed`.
    Recovered,
    /// Probe failed; `failed` is set when this probe crossed the threshold.
    Unhealthy {
        /// Consecutive failures so far.
        failures: u32,
        /// The server was moved to `Failed` by this probe.
        failed: bool,
    },
    /// Server not probed (disabled, unknown, mid-connect, or never connected).
    Skipped,
}

/// Applies probe outcomes for one pool. Shared by every probe loop.
#[derive(Clone)]
struct Prober {
    pool: ConnectionPool,
    registry: Arc<ServerRegistry>,
    failure_threshold: u32,
    probe_timeout: Duration,
}

/// Drives health probes for every enabled server.
pub struct HealthMonitor {
    prober: Prober,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor. Nothing runs until [`HealthMonitor::start`].
    pub fn new(pool: ConnectionPool, config: &HealthConfig) -> Self {
        Self {
            prober: Prober {
                registry: pool.registry().clone(),
                pool,
                failure_threshold: config.failure_threshold.max(1),
                probe_timeout: config.probe_timeout(),
            },
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one probe loop per enabled server at its configured interval.
    pub fn start(&self) {
        let registry = &self.prober.registry;
        let mut tasks = self.tasks.lock();
        for name in registry.enabled_names() {
            let Some(descriptor) = registry.descriptor(&name) else {
                continue;
            };
            let interval = descriptor.health_check_interval;
            if interval.is_zero() {
                tracing::debug!(server = %name, "health checks disabled");
                continue;
            }
            let prober = self.prober.clone();
            let token = self.cancel.child_token();
            tracing::debug!(server = %name, interval_secs = interval.as_secs(), "starting health monitor");
            tasks.push(tokio::spawn(async move {
                prober.run(name, interval, token).await;
            }));
        }
    }

    /// Probe `server` once and apply the outcome to the registry.
    pub async fn probe_once(&self, server: &str) -> ProbeOutcome {
        self.prober.probe_once(server).await
    }

    /// Number of running probe loops.
    pub fn running(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancel every probe loop and wait for them to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "health monitor task ended abnormally");
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Prober {
    async fn run(&self, server: String, interval: Duration, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                outcome = self.probe_once(&server) => {
                    tracing::trace!(server = %server, outcome = ?outcome, "health probe");
                }
            }
        }
        tracing::debug!(server = %server, "health monitor stopped");
    }

    /// Probe `server` once and apply the outcome to the registry.
    async fn probe_once(&self, server: &str) -> ProbeOutcome {
        let Some(status) = self.registry.status(server) else {
            return ProbeOutcome::Skipped;
        };
        let never_connected =
            status.state == ConnectionState::Disconnected && status.last_seen.is_none();
        if !status.enabled
            || never_connected
            || matches!(
                status.state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            )
        {
            return ProbeOutcome::Skipped;
        }

        match self.pool.probe(server, self.probe_timeout).await {
            Ok(()) => match self.registry.mark_connected(server) {
                Some(ConnectionState::Failed) => {
                    tracing::info!(server = %server, "server recovered");
                    ProbeOutcome::Recovered
                }
                _ => ProbeOutcome::Healthy,
            },
            Err(e) => {
                let failures = self.registry.record_failure(server, &e.to_string());
                let already_failed = self.registry.is_failed(server);
                tracing::debug!(server = %server, failures, error = %e, "health probe failed");
                if already_failed || failures < self.failure_threshold {
                    return ProbeOutcome::Unhealthy {
                        failures,
                        failed: false,
                    };
                }
                self.registry.mark_failed(
                    server,
                    &format!("{} consecutive health checks failed: {}", failures, e),
                );
                self.pool.disconnect(server).await;
                ProbeOutcome::Unhealthy {
                    failures,
                    failed: true,
                }
            }
        }
    }
}
