//! Server descriptors: how to reach a remote tool server and how hard to try.

use std::time::Duration;

use arbiter_config::{BackoffKind, ServerEntry, defaults};

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How a server is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// WebSocket endpoint, normalized at connect time.
    WebSocket {
        /// Address as configured.
        url: String,
        /// Headers sent on the upgrade request.
        headers: Vec<(String, String)>,
    },
    /// Child process speaking Content-Length framed JSON-RPC on stdio.
    Stdio {
        /// Program to spawn.
        command: String,
        /// Program arguments.
        args: Vec<String>,
        /// Extra environment variables.
        env: Vec<(String, String)>,
    },
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket { url, .. } => f.write_str(url),
            Self::Stdio { command, args, .. } if args.is_empty() => {
                write!(f, "stdio:{}", command)
            }
            Self::Stdio { command, args, .. } => {
                write!(f, "stdio:{} {}", command, args.join(" "))
            }
        }
    }
}

/// Delay policy between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Fixed or doubling.
    pub kind: BackoffKind,
}

impl Backoff {
    /// Delay before retry number `retry` (1-based), capped at 30 seconds.
    pub fn delay(&self, retry: u32) -> Duration {
        let delay = match self.kind {
            BackoffKind::Fixed => self.base,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1).min(16));
                self.base.saturating_mul(factor)
            }
        };
        delay.min(MAX_BACKOFF)
    }
}

/// A configured remote tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// Unique server name.
    pub name: String,
    /// Connection target.
    pub target: Target,
    /// Whether the server is used at startup.
    pub enabled: bool,
    /// Connect, handshake and per-call timeout.
    pub timeout: Duration,
    /// Additional connection attempts after the first one fails.
    pub retries: u32,
    /// Delay between connection attempts.
    pub backoff: Backoff,
    /// Interval between liveness probes.
    pub health_check_interval: Duration,
    /// Only these tools are exposed when set.
    pub allowed_tools: Option<Vec<String>>,
    /// Tools the operator declared read-only.
    pub read_only_tools: Vec<String>,
}

impl ServerDescriptor {
    /// Create a descriptor for a WebSocket server with default settings.
    pub fn websocket(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_target(
            name.into(),
            Target::WebSocket {
                url: url.into(),
                headers: Vec::new(),
            },
        )
    }

    /// Create a descriptor for a stdio server with default settings.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_target(
            name.into(),
            Target::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: Vec::new(),
            },
        )
    }

    fn with_target(name: String, target: Target) -> Self {
        Self {
            name,
            target,
            enabled: true,
            timeout: Duration::from_secs(defaults::SERVER_TIMEOUT_SECS),
            retries: defaults::RETRIES,
            backoff: Backoff {
                base: Duration::from_millis(defaults::RETRY_DELAY_MS),
                kind: BackoffKind::default(),
            },
            health_check_interval: Duration::from_secs(defaults::HEALTH_CHECK_INTERVAL_SECS),
            allowed_tools: None,
            read_only_tools: Vec::new(),
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, base: Duration, kind: BackoffKind) -> Self {
        self.backoff = Backoff { base, kind };
        self
    }

    /// Set the probe interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Restrict the exposed tools.
    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    /// Declare tools as read-only.
    pub fn with_read_only_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_only_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Add a WebSocket header. Ignored for stdio servers.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Target::WebSocket { headers, .. } = &mut self.target {
            headers.push((key.into(), value.into()));
        }
        self
    }

    /// Set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the allow-list admits `tool`.
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.allowed_tools
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|t| t == tool))
    }

    /// Whether the operator declared `tool` read-only.
    pub fn declares_read_only(&self, tool: &str) -> bool {
        self.read_only_tools.iter().any(|t| t == tool)
    }

    /// Total connection attempts for one `ensure_connected` cycle.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl From<&ServerEntry> for ServerDescriptor {
    fn from(entry: &ServerEntry) -> Self {
        let pairs = |items: &[[String; 2]]| {
            items
                .iter()
                .map(|[k, v]| (k.clone(), v.clone()))
                .collect::<Vec<_>>()
        };

        let target = match (&entry.url, &entry.command) {
            (_, Some(command)) => Target::Stdio {
                command: command.clone(),
                args: entry.args.clone(),
                env: pairs(&entry.env),
            },
            (Some(url), None) => Target::WebSocket {
                url: url.clone(),
                headers: pairs(&entry.headers),
            },
            (None, None) => Target::WebSocket {
                url: String::new(),
                headers: pairs(&entry.headers),
            },
        };

        Self {
            name: entry.name.clone(),
            target,
            enabled: entry.enabled,
            timeout: entry.timeout(),
            retries: entry.retries(),
            backoff: Backoff {
                base: entry.retry_delay(),
                kind: entry.backoff,
            },
            health_check_interval: entry.health_check_interval(),
            allowed_tools: entry.tools.clone(),
            read_only_tools: entry.read_only_tools.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            kind: BackoffKind::Exponential,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(40), MAX_BACKOFF);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff {
            base: Duration::from_millis(250),
            kind: BackoffKind::Fixed,
        };
        assert_eq!(backoff.delay(1), backoff.delay(5));
    }

    #[test]
    fn test_allow_list() {
        let open = ServerDescriptor::websocket("fs", "ws://localhost:1");
        assert!(open.allows_tool("anything"));

        let restricted = open.with_allowed_tools(["read_file"]);
        assert!(restricted.allows_tool("read_file"));
        assert!(!restricted.allows_tool("write_file"));
    }

    #[test]
    fn test_from_entry() {
        let entry = ServerEntry::stdio("git", "git-mcp")
            .with_arg("--repo")
            .with_tools(vec!["status".to_string()])
            .with_read_only_tools(vec!["status".to_string()]);
        let desc = ServerDescriptor::from(&entry);
        assert_eq!(desc.name, "git");
        assert!(desc.declares_read_only("status"));
        assert!(!desc.declares_read_only("log"));
        assert_eq!(desc.max_attempts(), 4);
        assert!(matches!(desc.target, Target::Stdio { ref args, .. } if args == &["--repo"]));
        assert_eq!(desc.target.to_string(), "stdio:git-mcp --repo");
        assert!(!desc.allows_tool("log"));

        let entry = ServerEntry::websocket("fs", "localhost:9000").with_header("X-Key", "k");
        let desc = ServerDescriptor::from(&entry);
        assert!(matches!(desc.target, Target::WebSocket { ref headers, .. } if headers.len() == 1));
    }
}
