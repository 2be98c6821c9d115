//! Risk classification.
//!
//! [`RiskClassifier::classify`] is a pure function of the descriptor and the
//! arguments. Rules are evaluated in order and the first match wins:
//!
//! 1. critical blocklist against the capability name and every string argument
//! 2. network request / remote tool call: Medium, High with write or delete intent
//! 3. file write: Medium; file delete: High
//! 4. shell execution: by command pattern
//! 5. read-only: Safe
//! 6. anything else: Low
//!
//! Every remote capability is decided at rule 2 and never lands below Medium,
//! except tools the operator declared read-only, which are Safe while their
//! arguments show no write intent.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use arbiter_config::SecurityConfig;
use arbiter_types::{Arguments, ToolCategory, ToolDescriptor};

use crate::error::{GateError, Result};

/// Ordered risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// Observes state only.
    Safe,
    /// Unlikely to cause harm.
    Low,
    /// Changes state or reaches the network.
    Medium,
    /// Destructive or privileged.
    High,
    /// Matches the destructive-operation blocklist.
    Critical,
}

impl RiskTier {
    /// All tiers in ascending order.
    pub const ALL: [RiskTier; 5] = [
        RiskTier::Safe,
        RiskTier::Low,
        RiskTier::Medium,
        RiskTier::High,
        RiskTier::Critical,
    ];

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tier plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assessment {
    /// Assessed tier.
    pub tier: RiskTier,
    /// Human-readable explanation.
    pub reason: String,
}

impl Assessment {
    fn new(tier: RiskTier, reason: impl Into<String>) -> Self {
        Self {
            tier,
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in patterns
// ─────────────────────────────────────────────────────────────────────────────

/// Destructive filesystem, disk and process-termination operations.
const CRITICAL_PATTERNS: &[(&str, &str)] = &[
    (
        r"\brm\s+(?:-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|-r\s+-f|-f\s+-r|--recursive\s+--force|--force\s+--recursive)",
        "recursive delete",
    ),
    (r"\bdd\s+if=/dev/(?:zero|random|urandom)", "disk overwrite"),
    (r"\bmkfs(?:\.[a-z0-9]+)?\s", "filesystem creation"),
    (r"\bfdisk\s", "disk partitioning"),
    (r"\bformat\s+(?:[a-z]:|/dev/)", "disk format"),
    (r"\bsudo\s+rm\b", "privileged delete"),
    (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}", "fork bomb"),
    (r"\bkill\s+-(?:9|kill)\b", "forced process kill"),
    (r"\b(?:killall|pkill)\s", "process termination"),
    (
        r"(?:^|[;&|]\s*|\bsudo\s+)(?:shutdown|reboot|halt|poweroff)\b",
        "system shutdown",
    ),
    (r"\bchmod\s+-r\s+777\s+/", "recursive permission change"),
    (r">\s*/dev/sd[a-z]", "write to a block device"),
    (r"/etc/(?:passwd|shadow|sudoers)\b", "critical system file"),
];

/// Shell commands that need elevated privileges or rewrite shared history.
const HIGH_COMMANDS: &[(&str, &str)] = &[
    (r"\bsudo\s", "privileged command"),
    (r"\bsu\s", "user switch"),
    (r"\bchmod\s+(?:-r\s+)?777\b", "world-writable permissions"),
    (r"\bchown\s", "ownership change"),
    (r"\bcrontab\s", "scheduled job change"),
    (r"\bgit\s+push\b.*(?:--force|\s-f\b)", "force push"),
];

/// Shell commands that modify or delete files, or reach the network.
const MEDIUM_COMMANDS: &[(&str, &str)] = &[
    (r"\brm\s.*\*", "wildcard delete"),
    (r"\bmv\s.*\*", "wildcard move"),
    (r"\bcp\s+-r\s", "recursive copy"),
    (r"\bfind\s.*-delete\b", "find with delete"),
    (r"\bxargs\s+rm\b", "bulk delete"),
    (r">\s*/etc/", "write to /etc"),
    (r"\bgit\s+reset\s+--hard\b", "hard reset"),
    (r"\bgit\s+clean\s+-[a-z]*f", "forced clean"),
    (r"\b(?:curl|wget|ssh|scp|ftp|telnet|nc)\s", "network utility"),
];

/// Read-only commands, only when nothing is chained or redirected.
const SAFE_COMMANDS: &[&str] = &[
    r"^(?:ls|cat|head|tail|grep|rg|wc|which|type|echo|file|stat|du|df)(?:\s|$)",
    r"^git\s+(?:status|log|diff|show|branch)\b",
    r"^(?:pwd|whoami|date|uname|hostname)$",
    r"^find\s.*-type\s+f",
];

/// Write or delete intent in arguments to network and remote tools.
const WRITE_INTENT: &str = r"\b(?:delete|remove|rm|drop|destroy|truncate|purge|write|overwrite|update|insert|upload|put|post|patch)\b";

/// Argument keys holding a command line.
const COMMAND_KEYS: &[&str] = &["command", "cmd", "script", "shell", "commandline"];

struct Rule {
    pattern: Regex,
    label: String,
}

fn compile(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
}

fn builtin_rules(patterns: &[(&str, &str)]) -> Vec<Rule> {
    patterns
        .iter()
        .filter_map(|(pattern, label)| {
            compile(pattern)
                .map_err(|e| {
                    tracing::warn!(pattern = %pattern, error = %e, "invalid built-in pattern, rule disabled");
                    e
                })
                .ok()
                .map(|pattern| Rule {
                    pattern,
                    label: label.to_string(),
                })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Classifier
// ─────────────────────────────────────────────────────────────────────────────

/// Maps a capability invocation to a [`RiskTier`].
pub struct RiskClassifier {
    critical: Vec<Rule>,
    high_commands: Vec<Rule>,
    medium_commands: Vec<Rule>,
    safe_commands: Vec<Regex>,
    write_intent: Option<Regex>,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskClassifier {
    /// Classifier with the built-in rules.
    pub fn new() -> Self {
        Self {
            critical: builtin_rules(CRITICAL_PATTERNS),
            high_commands: builtin_rules(HIGH_COMMANDS),
            medium_commands: builtin_rules(MEDIUM_COMMANDS),
            safe_commands: SAFE_COMMANDS
                .iter()
                .filter_map(|p| compile(p).ok())
                .collect(),
            write_intent: compile(WRITE_INTENT).ok(),
        }
    }

    /// Built-in rules plus extra critical patterns.
    pub fn with_patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut classifier = Self::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = compile(pattern).map_err(|source| GateError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            classifier.critical.push(Rule {
                pattern: regex,
                label: format!("custom pattern '{}'", pattern),
            });
        }
        Ok(classifier)
    }

    /// Classifier for the `[security]` section.
    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        Self::with_patterns(&config.critical_patterns)
    }

    /// Number of critical rules.
    pub fn critical_rule_count(&self) -> usize {
        self.critical.len()
    }

    /// Assess an invocation.
    pub fn classify(&self, descriptor: &ToolDescriptor, args: &Arguments) -> Assessment {
        let strings = string_arguments(args);

        let candidates = std::iter::once(descriptor.name.as_str()).chain(strings.iter().map(String::as_str));
        for text in candidates {
            if let Some(rule) = self.critical.iter().find(|r| r.pattern.is_match(text)) {
                return Assessment::new(
                    RiskTier::Critical,
                    format!("matches critical blocklist: {}", rule.label),
                );
            }
        }

        if descriptor.is_remote() {
            return self.classify_remote(descriptor.category, args, &strings);
        }

        match descriptor.category {
            ToolCategory::Network | ToolCategory::RemoteCall => {
                match self.write_intent(args, &strings) {
                    Some(word) => Assessment::new(
                        RiskTier::High,
                        format!("{} with {} intent", descriptor.category, word),
                    ),
                    None => Assessment::new(RiskTier::Medium, descriptor.category.to_string()),
                }
            }
            ToolCategory::FileWrite => Assessment::new(RiskTier::Medium, "file write"),
            ToolCategory::FileDelete => Assessment::new(RiskTier::High, "file delete"),
            ToolCategory::Execute => self.classify_command(&command_text(args, &strings)),
            ToolCategory::ReadOnly => Assessment::new(RiskTier::Safe, "read-only"),
            ToolCategory::Unclassified => Assessment::new(RiskTier::Low, "unclassified capability"),
        }
    }

    /// Tier only.
    pub fn classify_tier(&self, descriptor: &ToolDescriptor, args: &Arguments) -> RiskTier {
        self.classify(descriptor, args).tier
    }

    fn classify_remote(&self, category: ToolCategory, args: &Arguments, strings: &[String]) -> Assessment {
        match category {
            ToolCategory::FileDelete => Assessment::new(RiskTier::High, "remote file delete"),
            ToolCategory::Execute => {
                let assessment = self.classify_command(&command_text(args, strings));
                if assessment.tier < RiskTier::Medium {
                    Assessment::new(RiskTier::Medium, "remote shell execution")
                } else {
                    assessment
                }
            }
            ToolCategory::FileWrite => Assessment::new(RiskTier::Medium, "remote file write"),
            _ => match self.write_intent(args, strings) {
                Some(word) => Assessment::new(
                    RiskTier::High,
                    format!("remote tool call with {} intent", word),
                ),
                None if category == ToolCategory::ReadOnly => {
                    Assessment::new(RiskTier::Safe, "declared read-only")
                }
                None if category == ToolCategory::Network => {
                    Assessment::new(RiskTier::Medium, "network request")
                }
                None => Assessment::new(RiskTier::Medium, "remote tool call"),
            },
        }
    }

    fn classify_command(&self, command: &str) -> Assessment {
        let command = command.trim();
        if command.is_empty() {
            return Assessment::new(RiskTier::Medium, "shell execution");
        }
        if let Some(rule) = self.high_commands.iter().find(|r| r.pattern.is_match(command)) {
            return Assessment::new(RiskTier::High, format!("shell execution: {}", rule.label));
        }
        if let Some(rule) = self.medium_commands.iter().find(|r| r.pattern.is_match(command)) {
            return Assessment::new(RiskTier::Medium, format!("shell execution: {}", rule.label));
        }
        let chained = command.contains(['|', ';', '&', '>', '<', '`']) || command.contains("$(");
        if !chained && self.safe_commands.iter().any(|r| r.is_match(command)) {
            return Assessment::new(RiskTier::Safe, "read-only shell command");
        }
        Assessment::new(RiskTier::Medium, "shell execution")
    }

    fn write_intent(&self, args: &Arguments, strings: &[String]) -> Option<String> {
        let regex = self.write_intent.as_ref()?;
        args.keys()
            .map(String::as_str)
            .chain(strings.iter().map(String::as_str))
            .find_map(|text| regex.find(text).map(|m| m.as_str().to_lowercase()))
    }
}

impl std::fmt::Debug for RiskClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskClassifier")
            .field("critical_rules", &self.critical.len())
            .finish_non_exhaustive()
    }
}

/// Every string value in the arguments, depth first.
fn string_arguments(args: &Arguments) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    for value in args.values() {
        walk(value, &mut out);
    }
    out
}

/// The command line of a shell tool invocation.
fn command_text(args: &Arguments, strings: &[String]) -> String {
    for key in COMMAND_KEYS {
        match args.get(*key) {
            Some(Value::String(command)) => return command.clone(),
            Some(Value::Array(parts)) => {
                return parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ");
            }
            _ => {}
        }
    }
    strings.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("arguments must be an object"),
        }
    }

    fn local(name: &str, category: ToolCategory) -> ToolDescriptor {
        ToolDescriptor::local(name, "", json!({}), category)
    }

    #[test]
    fn test_tier_order() {
        assert!(RiskTier::Safe < RiskTier::Low);
        assert!(RiskTier::High < RiskTier::Critical);
        assert_eq!(RiskTier::ALL.iter().max(), Some(&RiskTier::Critical));
        assert_eq!(serde_json::to_string(&RiskTier::Medium).unwrap(), "\"medium\"");
    }

    #[test]
    fn test_remote_read_named_tool_is_not_safe() {
        let classifier = RiskClassifier::new();
        let read = ToolDescriptor::remote("fs", "read_file", None, None);
        let assessment = classifier.classify(&read, &args(json!({"path": "a.txt"})));
        assert_eq!(assessment.tier, RiskTier::Medium);
        assert_eq!(assessment.reason, "remote tool call");

        let query = ToolDescriptor::remote("db", "query", None, None);
        let assessment = classifier.classify(&query, &args(json!({"sql": "DELETE FROM users"})));
        assert_eq!(assessment.tier, RiskTier::High);
        assert_eq!(assessment.reason, "remote tool call with delete intent");
    }

    #[test]
    fn test_declared_read_only_remote() {
        let classifier = RiskClassifier::new();
        let read = ToolDescriptor::remote("fs", "read_file", None, None).declared_read_only();
        assert_eq!(
            classifier.classify_tier(&read, &args(json!({"path": "a.txt"}))),
            RiskTier::Safe
        );

        let query = ToolDescriptor::remote("db", "query", None, None).declared_read_only();
        assert_eq!(
            classifier.classify_tier(&query, &args(json!({"sql": "DELETE FROM users"}))),
            RiskTier::High
        );
    }

    #[test]
    fn test_remote_destructive_categories() {
        let classifier = RiskClassifier::new();
        let delete = ToolDescriptor::remote("fs", "delete_file", None, None);
        assert_eq!(
            classifier.classify_tier(&delete, &args(json!({"path": "a.txt"}))),
            RiskTier::High
        );

        let exec = ToolDescriptor::remote("box", "run_command", None, None);
        assert_eq!(
            classifier.classify_tier(&exec, &args(json!({"command": "ls -la"}))),
            RiskTier::Medium
        );
        assert_eq!(
            classifier.classify_tier(&exec, &args(json!({"command": "sudo apt install x"}))),
            RiskTier::High
        );
    }

    #[test]
    fn test_recursive_delete_is_critical_for_any_tool() {
        let classifier = RiskClassifier::new();
        let read = ToolDescriptor::remote("fs", "read_file", None, None);
        for command in ["rm -rf build", "rm -fr /tmp/x", "sudo rm -Rf /", "rm -r -f ."] {
            let assessment = classifier.classify(&read, &args(json!({"path": command})));
            assert_eq!(assessment.tier, RiskTier::Critical, "{}", command);
        }

        let nested = args(json!({"steps": [{"run": "echo ok"}, {"run": "rm -rf /"}]}));
        let shell = local("run_shell", ToolCategory::Execute);
        assert_eq!(classifier.classify_tier(&shell, &nested), RiskTier::Critical);
    }

    #[test]
    fn test_critical_patterns() {
        let classifier = RiskClassifier::new();
        let shell = local("bash", ToolCategory::Execute);
        for command in [
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sdb1",
            ":(){ :|:& };:",
            "kill -9 1",
            "killall node",
            "sudo reboot",
            "cat /etc/shadow",
            "echo x > /dev/sda",
        ] {
            assert_eq!(
                classifier.classify_tier(&shell, &args(json!({"command": command}))),
                RiskTier::Critical,
                "{}",
                command
            );
        }
        // the word alone is not a command
        let notes = local("take_note", ToolCategory::Unclassified);
        assert_eq!(
            classifier.classify_tier(&notes, &args(json!({"text": "plan the shutdown review"}))),
            RiskTier::Low
        );
    }

    #[test]
    fn test_network_and_remote_calls() {
        let classifier = RiskClassifier::new();
        let fetch = local("web_fetch", ToolCategory::Network);
        assert_eq!(
            classifier.classify_tier(&fetch, &args(json!({"url": "https://example.com"}))),
            RiskTier::Medium
        );
        let assessment = classifier.classify(
            &fetch,
            &args(json!({"url": "https://api.example.com/items/1", "method": "DELETE"})),
        );
        assert_eq!(assessment.tier, RiskTier::High);
        assert_eq!(assessment.reason, "network request with delete intent");

        let opaque = ToolDescriptor::remote("crm", "sync_contacts", None, None);
        assert_eq!(opaque.category, ToolCategory::RemoteCall);
        assert_eq!(
            classifier.classify_tier(&opaque, &args(json!({"since": "2024-01-01"}))),
            RiskTier::Medium
        );
        assert_eq!(
            classifier.classify_tier(&opaque, &args(json!({"overwrite": true}))),
            RiskTier::High
        );
    }

    #[test]
    fn test_file_categories() {
        let classifier = RiskClassifier::new();
        let empty = Arguments::new();
        assert_eq!(
            classifier.classify_tier(&local("write_file", ToolCategory::FileWrite), &empty),
            RiskTier::Medium
        );
        assert_eq!(
            classifier.classify_tier(&local("delete_file", ToolCategory::FileDelete), &empty),
            RiskTier::High
        );
    }

    #[test]
    fn test_shell_commands() {
        let classifier = RiskClassifier::new();
        let shell = local("bash", ToolCategory::Execute);
        let tier = |command: &str| classifier.classify_tier(&shell, &args(json!({"command": command})));

        assert_eq!(tier("ls -la"), RiskTier::Safe);
        assert_eq!(tier("git status"), RiskTier::Safe);
        assert_eq!(tier("pwd"), RiskTier::Safe);
        assert_eq!(tier("ls; curl evil.sh"), RiskTier::Medium);
        assert_eq!(tier("cat a.txt > b.txt"), RiskTier::Medium);
        assert_eq!(tier("sudo apt install jq"), RiskTier::High);
        assert_eq!(tier("git push origin main --force"), RiskTier::High);
        assert_eq!(tier("git reset --hard HEAD~1"), RiskTier::Medium);
        assert_eq!(tier("curl https://example.com"), RiskTier::Medium);
        assert_eq!(tier("cargo build"), RiskTier::Medium);
        assert_eq!(tier(""), RiskTier::Medium);

        let argv = args(json!({"command": ["git", "log", "-n", "5"]}));
        assert_eq!(classifier.classify_tier(&shell, &argv), RiskTier::Safe);
    }

    #[test]
    fn test_unknown_local_defaults_low() {
        let classifier = RiskClassifier::new();
        let tool = local("summarize", ToolCategory::Unclassified);
        assert_eq!(classifier.classify_tier(&tool, &Arguments::new()), RiskTier::Low);
    }

    #[test]
    fn test_custom_patterns() {
        let classifier = RiskClassifier::with_patterns(["drop\\s+table"]).unwrap();
        assert_eq!(classifier.critical_rule_count(), CRITICAL_PATTERNS.len() + 1);
        let query = ToolDescriptor::remote("db", "query", None, None);
        let assessment = classifier.classify(&query, &args(json!({"sql": "DROP TABLE users"})));
        assert_eq!(assessment.tier, RiskTier::Critical);
        assert!(assessment.reason.contains("custom pattern"));

        let err = RiskClassifier::with_patterns(["("]).unwrap_err();
        assert!(matches!(err, GateError::InvalidPattern { .. }));
    }

    #[test]
    fn test_builtin_patterns_compile() {
        let classifier = RiskClassifier::new();
        assert_eq!(classifier.critical.len(), CRITICAL_PATTERNS.len());
        assert_eq!(classifier.high_commands.len(), HIGH_COMMANDS.len());
        assert_eq!(classifier.medium_commands.len(), MEDIUM_COMMANDS.len());
        assert_eq!(classifier.safe_commands.len(), SAFE_COMMANDS.len());
        assert!(classifier.write_intent.is_some());
    }

    fn category_strategy() -> impl Strategy<Value = ToolCategory> {
        prop_oneof![
            Just(ToolCategory::ReadOnly),
            Just(ToolCategory::FileWrite),
            Just(ToolCategory::FileDelete),
            Just(ToolCategory::Execute),
            Just(ToolCategory::Network),
            Just(ToolCategory::RemoteCall),
            Just(ToolCategory::Unclassified),
        ]
    }

    proptest! {
        /// Classification is a pure, total function.
        #[test]
        fn classify_is_deterministic(
            name in "[a-z_]{1,20}",
            category in category_strategy(),
            values in prop::collection::btree_map("[a-z]{1,8}", ".{0,40}", 0..5),
        ) {
            let classifier = RiskClassifier::new();
            let descriptor = local(&name, category);
            let arguments: Arguments = values
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();

            let first = classifier.classify(&descriptor, &arguments);
            let second = classifier.classify(&descriptor, &arguments);
            prop_assert_eq!(&first, &second);
            prop_assert!(RiskTier::ALL.contains(&first.tier));
            prop_assert!(!first.reason.is_empty());
        }

        /// Read-only tools are Safe unless an argument hits the blocklist.
        #[test]
        fn read_only_is_safe_or_critical(path in "[a-zA-Z0-9_./ -]{0,40}") {
            let classifier = RiskClassifier::new();
            let descriptor = local("read_file", ToolCategory::ReadOnly);
            let arguments = args(json!({"path": path}));
            let tier = classifier.classify_tier(&descriptor, &arguments);
            prop_assert!(tier == RiskTier::Safe || tier == RiskTier::Critical);
        }

        /// A read-like name never lowers an undeclared remote tool below Medium.
        #[test]
        fn remote_tools_floor_at_medium(
            name in "(get|read|list|query|search|fetch|show)_[a-z]{0,10}",
            values in prop::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9 ]{0,40}", 0..5),
        ) {
            let classifier = RiskClassifier::new();
            let descriptor = ToolDescriptor::remote("srv", name, None, None);
            let arguments: Arguments = values
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            prop_assert!(classifier.classify_tier(&descriptor, &arguments) >= RiskTier::Medium);
        }
    }
}
