//! Capability descriptors.
//!
//! A [`ToolDescriptor`] is resolved once, at registration or discovery time.
//! Its [`ToolOrigin`] says whether invocation goes to the local registry or to
//! a remote server, and its [`ToolCategory`] feeds risk classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool arguments: a string-keyed JSON map.
pub type Arguments = serde_json::Map<String, Value>;

/// Build the globally unique name of a remote tool.
pub fn namespaced(server: &str, tool: &str) -> String {
    format!("{server}_{tool}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Category
// ─────────────────────────────────────────────────────────────────────────────

/// Broad category of what a capability does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Reads or introspects state without changing it.
    ReadOnly,
    /// Creates or modifies files.
    FileWrite,
    /// Removes files or other persistent data.
    FileDelete,
    /// Runs shell commands or arbitrary programs.
    Execute,
    /// Makes outbound network requests.
    Network,
    /// A remote tool whose behaviour could not be inferred.
    RemoteCall,
    /// Nothing is known about the capability.
    #[default]
    Unclassified,
}

const DELETE_WORDS: &[&str] = &[
    "delete", "remove", "rm", "rmdir", "unlink", "drop", "purge", "destroy", "truncate", "erase",
];
const EXECUTE_WORDS: &[&str] = &[
    "exec", "execute", "run", "shell", "bash", "sh", "command", "cmd", "spawn", "eval", "terminal",
];
const NETWORK_WORDS: &[&str] = &[
    "fetch", "http", "https", "request", "download", "upload", "curl", "web", "url", "browse",
    "webhook",
];
const WRITE_WORDS: &[&str] = &[
    "write", "create", "update", "edit", "save", "put", "append", "move", "rename", "copy",
    "mkdir", "patch", "set", "insert", "modify", "replace", "commit",
];
const READ_WORDS: &[&str] = &[
    "read", "get", "list", "ls", "search", "find", "grep", "glob", "stat", "show", "describe",
    "view", "cat", "info", "status", "query", "head", "tail", "inspect", "count", "diff", "log",
];

impl ToolCategory {
    /// Infer a category from a tool name such as `read_file` or `deleteBranch`.
    ///
    /// Destructive words win over everything else, so `read_and_delete` is a
    /// delete. Returns `None` when no word is recognised.
    pub fn infer(tool_name: &str) -> Option<Self> {
        let words = split_words(tool_name);
        let has = |set: &[&str]| words.iter().any(|w| set.contains(&w.as_str()));

        if has(DELETE_WORDS) {
            Some(Self::FileDelete)
        } else if has(EXECUTE_WORDS) {
            Some(Self::Execute)
        } else if has(NETWORK_WORDS) {
            Some(Self::Network)
        } else if has(WRITE_WORDS) {
            Some(Self::FileWrite)
        } else if has(READ_WORDS) {
            Some(Self::ReadOnly)
        } else {
            None
        }
    }

    /// Whether the capability only observes state.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReadOnly => "read-only",
            Self::FileWrite => "file write",
            Self::FileDelete => "file delete",
            Self::Execute => "execute",
            Self::Network => "network request",
            Self::RemoteCall => "remote tool call",
            Self::Unclassified => "unclassified",
        };
        f.write_str(s)
    }
}

/// Split snake_case, kebab-case, dotted and camelCase names into lowercase words.
fn split_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in name.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor
// ─────────────────────────────────────────────────────────────────────────────

/// Where a capability is implemented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ToolOrigin {
    /// Implemented in-process by the local tool registry.
    Local,
    /// Exposed by a remote tool server.
    Remote {
        /// Name of the owning server.
        server: String,
        /// The tool's name as the server knows it.
        tool: String,
    },
}

/// A capability as seen by the gate, the catalog and callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Globally unique capability name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: Value,
    /// What kind of thing the capability does.
    pub category: ToolCategory,
    /// Local or remote.
    #[serde(flatten)]
    pub origin: ToolOrigin,
}

impl ToolDescriptor {
    /// Describe a local tool.
    pub fn local(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            category,
            origin: ToolOrigin::Local,
        }
    }

    /// Describe a tool advertised by `server`.
    ///
    /// The name is namespaced as `<server>_<tool>`. The server chooses the
    /// tool name, so a name that only suggests reading is not trusted: such a
    /// tool, like one whose name gives no hint, is categorised as
    /// [`ToolCategory::RemoteCall`]. Use [`ToolDescriptor::declared_read_only`]
    /// for tools the operator vouches for.
    pub fn remote(
        server: impl Into<String>,
        tool: impl Into<String>,
        description: Option<String>,
        input_schema: Option<Value>,
    ) -> Self {
        let server = server.into();
        let tool = tool.into();
        let category = match ToolCategory::infer(&tool) {
            Some(ToolCategory::ReadOnly) | None => ToolCategory::RemoteCall,
            Some(category) => category,
        };
        let description = description
            .unwrap_or_else(|| format!("Tool '{}' provided by server '{}'", tool, server));
        let parameters = input_schema.unwrap_or_else(|| {
            serde_json::json!({
                "type": "object",
                "properties": {},
            })
        });

        Self {
            name: namespaced(&server, &tool),
            description,
            parameters,
            category,
            origin: ToolOrigin::Remote { server, tool },
        }
    }

    /// Mark the capability read-only on the operator's word.
    pub fn declared_read_only(mut self) -> Self {
        self.category = ToolCategory::ReadOnly;
        self
    }

    /// Override the inferred category.
    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    /// Whether the capability lives on a remote server.
    pub fn is_remote(&self) -> bool {
        matches!(self.origin, ToolOrigin::Remote { .. })
    }

    /// The owning server, if any.
    pub fn server(&self) -> Option<&str> {
        match &self.origin {
            ToolOrigin::Remote { server, .. } => Some(server),
            ToolOrigin::Local => None,
        }
    }
}

/// An invocation submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Capability name.
    pub name: String,
    /// Arguments keyed by parameter name.
    #[serde(default)]
    pub arguments: Arguments,
}

impl ToolRequest {
    /// Create a request.
    pub fn new(name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}
