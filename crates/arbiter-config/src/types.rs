//! Configuration types.
//!
//! ```toml
//! [pipeline]
//! max_concurrent_calls = 8
//! approval_timeout_secs = 120
//! risk_profile = "balanced"
//!
//! [security]
//! critical_patterns = ['\bterraform\s+destroy\b']
//! decision_store = "~/.config/arbiter/decisions.jsonl"
//!
//! [[servers]]
//! name = "fs"
//! url = "ws://localhost:8765"
//! tools = ["read_file", "list_dir"]
//! read_only_tools = ["read_file", "list_dir"]
//!
//! [[servers]]
//! name = "git"
//! command = "git-mcp"
//! args = ["--repo", "."]
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Default values shared by the config types and their consumers.
pub mod defaults {
    pub const MAX_CONCURRENT_CALLS: usize = 8;
    pub const APPROVAL_TIMEOUT_SECS: u64 = 120;
    pub const SERVER_TIMEOUT_SECS: u64 = 30;
    pub const RETRIES: u32 = 3;
    pub const RETRY_DELAY_MS: u64 = 1000;
    pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;
    pub const FAILURE_THRESHOLD: u32 = 3;
    pub const PROBE_TIMEOUT_SECS: u64 = 5;
    pub const HISTORY_LIMIT: usize = 500;
}

// ─────────────────────────────────────────────────────────────────────────────
// Root
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Global pipeline settings.
    pub pipeline: Option<PipelineConfig>,
    /// Risk and approval policy.
    pub security: Option<SecurityConfig>,
    /// Health monitor tuning.
    pub health: Option<HealthConfig>,
    /// Log output.
    pub logging: Option<LoggingConfig>,
    /// Remote tool servers.
    pub servers: Vec<ServerEntry>,
}

impl ArbiterConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole; servers are merged by name.
    pub fn merge(&mut self, other: ArbiterConfig) {
        if other.pipeline.is_some() {
            self.pipeline = other.pipeline;
        }
        if other.security.is_some() {
            self.security = other.security;
        }
        if other.health.is_some() {
            self.health = other.health;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }

        for server in other.servers {
            match self.servers.iter_mut().find(|s| s.name == server.name) {
                Some(existing) => *existing = server,
                None => self.servers.push(server),
            }
        }
    }

    /// Pipeline settings, or defaults when the section is absent.
    pub fn pipeline(&self) -> PipelineConfig {
        self.pipeline.clone().unwrap_or_default()
    }

    /// Security settings, or defaults when the section is absent.
    pub fn security(&self) -> SecurityConfig {
        self.security.clone().unwrap_or_default()
    }

    /// Health settings, or defaults when the section is absent.
    pub fn health(&self) -> HealthConfig {
        self.health.clone().unwrap_or_default()
    }

    /// Logging settings, or defaults when the section is absent.
    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Look up a server entry by name.
    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let pipeline = self.pipeline();
        if pipeline.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if pipeline.approval_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.approval_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.health().failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(ConfigError::Invalid("server name cannot be empty".to_string()));
            }
            if server.name.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "server name '{}' cannot contain whitespace",
                    server.name
                )));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
            match (&server.url, &server.command) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "server '{}' sets both url and command",
                        server.name
                    )));
                }
                (None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "server '{}' needs a url or a command",
                        server.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Named approval policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    /// Only Safe invocations run without a prompt.
    Strict,
    /// Safe and Low invocations run without a prompt.
    #[default]
    Balanced,
    /// Everything up to Medium runs without a prompt.
    Permissive,
}

/// The `[pipeline]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Whether remote tool servers are used at all.
    pub enabled: bool,
    /// Discover tools from every enabled server at startup.
    pub auto_discover: bool,
    /// Upper bound on in-flight remote calls across all servers.
    pub max_concurrent_calls: usize,
    /// How long to wait for an approval decision before denying.
    pub approval_timeout_secs: u64,
    /// Approval policy profile.
    pub risk_profile: RiskProfile,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_discover: true,
            max_concurrent_calls: defaults::MAX_CONCURRENT_CALLS,
            approval_timeout_secs: defaults::APPROVAL_TIMEOUT_SECS,
            risk_profile: RiskProfile::default(),
        }
    }
}

impl PipelineConfig {
    /// Approval timeout as a duration.
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Security
// ─────────────────────────────────────────────────────────────────────────────

/// What an "always allow" decision is keyed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlwaysAllowScope {
    /// The capability name alone.
    #[default]
    Capability,
    /// The capability name plus the set of argument keys.
    CapabilityAndArguments,
}

/// The `[security]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Extra regexes appended to the built-in critical blocklist.
    pub critical_patterns: Vec<String>,
    /// Key used for remembered "always allow" decisions.
    pub always_allow_scope: AlwaysAllowScope,
    /// Append-only file for remembered decisions. In-memory only when unset.
    pub decision_store: Option<String>,
    /// Number of decisions kept in the audit history.
    pub history_limit: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            critical_patterns: Vec::new(),
            always_allow_scope: AlwaysAllowScope::default(),
            decision_store: None,
            history_limit: defaults::HISTORY_LIMIT,
        }
    }
}

impl SecurityConfig {
    /// The decision store path with a leading `~/` expanded.
    pub fn decision_store_path(&self) -> Option<PathBuf> {
        let raw = self.decision_store.as_deref()?;
        match raw.strip_prefix("~/") {
            Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
            None => Some(PathBuf::from(raw)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

/// The `[health]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failed probes before a server is marked failed.
    pub failure_threshold: u32,
    /// Timeout for a single ping probe.
    pub probe_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::FAILURE_THRESHOLD,
            probe_timeout_secs: defaults::PROBE_TIMEOUT_SECS,
        }
    }
}

impl HealthConfig {
    /// Probe timeout as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// The `[logging]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write JSON logs to a daily rotated file in the config directory.
    pub file: bool,
    /// Filter directive for the console, e.g. `"arbiter_mcp=debug,info"`.
    pub filter: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Servers
// ─────────────────────────────────────────────────────────────────────────────

/// Delay growth between connection attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// The same delay before every retry.
    Fixed,
    /// The delay doubles after every failed attempt.
    #[default]
    Exponential,
}

fn default_enabled() -> bool {
    true
}

/// Configuration for a single remote tool server.
///
/// Exactly one of `url` (WebSocket) or `command` (stdio child process) is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Unique name, used as the tool namespace prefix.
    pub name: String,
    /// WebSocket address. `http(s)` schemes and bare `host:port` are accepted.
    #[serde(default)]
    pub url: Option<String>,
    /// Program to spawn for stdio transport.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for `command` as `[key, value]` pairs.
    #[serde(default)]
    pub env: Vec<[String; 2]>,
    /// Headers sent on the WebSocket upgrade as `[key, value]` pairs.
    #[serde(default)]
    pub headers: Vec<[String; 2]>,
    /// Whether the server is used. Defaults to true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connect and per-call timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Additional connection attempts after the first one fails.
    #[serde(default)]
    pub retries: Option<u32>,
    /// Delay before the first retry in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// How the retry delay grows.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Seconds between liveness probes.
    #[serde(default)]
    pub health_check_interval_secs: Option<u64>,
    /// Only these tools are exposed when set.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// Tools the operator vouches only read state. Everything else this
    /// server exposes is classified as a remote call.
    #[serde(default)]
    pub read_only_tools: Vec<String>,
}

impl ServerEntry {
    /// Create an entry for a WebSocket server.
    pub fn websocket(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::empty(name.into())
        }
    }

    /// Create an entry for a stdio server.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::empty(name.into())
        }
    }

    fn empty(name: String) -> Self {
        Self {
            name,
            url: None,
            command: None,
            args: Vec::new(),
            env: Vec::new(),
            headers: Vec::new(),
            enabled: true,
            timeout_secs: None,
            retries: None,
            retry_delay_ms: None,
            backoff: BackoffKind::default(),
            health_check_interval_secs: None,
            tools: None,
            read_only_tools: Vec::new(),
        }
    }

    /// Add an argument (stdio only).
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add a header (WebSocket only).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push([key.into(), value.into()]);
        self
    }

    /// Restrict the exposed tools.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Declare tools as read-only.
    pub fn with_read_only_tools(mut self, tools: Vec<String>) -> Self {
        self.read_only_tools = tools;
        self
    }

    /// Set enabled state.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Connect and per-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(defaults::SERVER_TIMEOUT_SECS))
    }

    /// Additional connection attempts after the first.
    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(defaults::RETRIES)
    }

    /// Delay before the first retry.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(defaults::RETRY_DELAY_MS))
    }

    /// Interval between liveness probes.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(
            self.health_check_interval_secs
                .unwrap_or(defaults::HEALTH_CHECK_INTERVAL_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = ArbiterConfig::from_toml("").unwrap();
        assert!(config.servers.is_empty());
        let pipeline = config.pipeline();
        assert!(pipeline.enabled);
        assert!(pipeline.auto_discover);
        assert_eq!(pipeline.max_concurrent_calls, 8);
        assert_eq!(pipeline.risk_profile, RiskProfile::Balanced);
        assert_eq!(config.health().failure_threshold, 3);
        assert_eq!(config.security().always_allow_scope, AlwaysAllowScope::Capability);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[pipeline]
max_concurrent_calls = 2
approval_timeout_secs = 10
risk_profile = "strict"

[security]
critical_patterns = ['\bterraform\s+destroy\b']
always_allow_scope = "capability_and_arguments"
decision_store = "/tmp/decisions.jsonl"

[health]
failure_threshold = 5
probe_timeout_secs = 2

[[servers]]
name = "fs"
url = "ws://localhost:8765"
timeout_secs = 10
retries = 1
retry_delay_ms = 50
backoff = "fixed"
health_check_interval_secs = 15
tools = ["read_file"]
read_only_tools = ["read_file"]
headers = [["Authorization", "Bearer abc"]]

[[servers]]
name = "git"
command = "git-mcp"
args = ["--repo", "."]
enabled = false
"#;
        let config = ArbiterConfig::from_toml(toml).unwrap();
        config.validate().unwrap();

        let pipeline = config.pipeline();
        assert_eq!(pipeline.max_concurrent_calls, 2);
        assert_eq!(pipeline.approval_timeout(), Duration::from_secs(10));
        assert_eq!(pipeline.risk_profile, RiskProfile::Strict);

        let security = config.security();
        assert_eq!(security.critical_patterns.len(), 1);
        assert_eq!(
            security.always_allow_scope,
            AlwaysAllowScope::CapabilityAndArguments
        );
        assert_eq!(
            security.decision_store_path(),
            Some(PathBuf::from("/tmp/decisions.jsonl"))
        );

        let fs = config.server("fs").unwrap();
        assert_eq!(fs.timeout(), Duration::from_secs(10));
        assert_eq!(fs.retries(), 1);
        assert_eq!(fs.retry_delay(), Duration::from_millis(50));
        assert_eq!(fs.backoff, BackoffKind::Fixed);
        assert_eq!(fs.health_check_interval(), Duration::from_secs(15));
        assert_eq!(fs.tools.as_deref(), Some(&["read_file".to_string()][..]));
        assert_eq!(fs.headers[0][0], "Authorization");
        assert_eq!(fs.read_only_tools, vec!["read_file".to_string()]);

        let git = config.server("git").unwrap();
        assert!(!git.enabled);
        assert_eq!(git.command.as_deref(), Some("git-mcp"));
        assert_eq!(git.retries(), 3);
        assert_eq!(git.backoff, BackoffKind::Exponential);
        assert!(git.read_only_tools.is_empty());
    }

    #[test]
    fn test_validate_duplicate_servers() {
        let mut config = ArbiterConfig::new();
        config.servers.push(ServerEntry::websocket("fs", "ws://a"));
        config.servers.push(ServerEntry::websocket("fs", "ws://b"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate server name 'fs'"));
    }

    #[test]
    fn test_validate_target() {
        let mut config = ArbiterConfig::new();
        let mut entry = ServerEntry::websocket("fs", "ws://a");
        entry.command = Some("fs-mcp".to_string());
        config.servers.push(entry);
        assert!(config.validate().is_err());

        let mut config = ArbiterConfig::new();
        let mut entry = ServerEntry::websocket("fs", "ws://a");
        entry.url = None;
        config.servers.push(entry);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let config = ArbiterConfig::from_toml("[pipeline]\nmax_concurrent_calls = 0").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_merge_servers_by_name() {
        let mut base = ArbiterConfig::new();
        base.servers.push(ServerEntry::websocket("fs", "ws://a"));
        base.servers.push(ServerEntry::stdio("git", "git-mcp"));

        let mut overlay = ArbiterConfig::new();
        overlay.servers.push(ServerEntry::websocket("fs", "ws://b").with_enabled(false));
        overlay.servers.push(ServerEntry::websocket("web", "ws://c"));
        overlay.pipeline = Some(PipelineConfig {
            max_concurrent_calls: 1,
            ..Default::default()
        });

        base.merge(overlay);
        assert_eq!(base.servers.len(), 3);
        let fs = base.server("fs").unwrap();
        assert_eq!(fs.url.as_deref(), Some("ws://b"));
        assert!(!fs.enabled);
        assert_eq!(base.pipeline().max_concurrent_calls, 1);
    }

    #[test]
    fn test_decision_store_home_expansion() {
        let security = SecurityConfig {
            decision_store: Some("~/arbiter/decisions.jsonl".to_string()),
            ..Default::default()
        };
        if let (Some(path), Some(home)) = (security.decision_store_path(), dirs::home_dir()) {
            assert_eq!(path, home.join("arbiter/decisions.jsonl"));
        }
    }
}
