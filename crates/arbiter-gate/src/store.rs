//! Remembered approval decisions.
//!
//! An append-only JSONL log. Each line records one change to a key; the log is
//! replayed on open so the last line for a key wins.
//!
//! Layout: `{"key":"fs_write_file","action":"allow","at":"2025-..."}`

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use arbiter_config::AlwaysAllowScope;
use arbiter_types::{Arguments, ToolDescriptor};

use crate::error::{GateError, Result};

/// A remembered decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Remembered {
    /// Run without prompting.
    Allow,
    /// Refuse without prompting.
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Action {
    Allow,
    Deny,
    Forget,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: String,
    action: Action,
    at: DateTime<Utc>,
}

/// Key a remembered decision is stored under.
///
/// `Capability` keys by name alone. `CapabilityAndArguments` adds the sorted
/// argument keys, e.g. `fs_write_file(content,path)`.
pub fn decision_key(descriptor: &ToolDescriptor, args: &Arguments, scope: AlwaysAllowScope) -> String {
    match scope {
        AlwaysAllowScope::Capability => descriptor.name.clone(),
        AlwaysAllowScope::CapabilityAndArguments => {
            let mut keys: Vec<&str> = args.keys().map(String::as_str).collect();
            keys.sort_unstable();
            format!("{}({})", descriptor.name, keys.join(","))
        }
    }
}

/// Remembered decisions, optionally persisted.
pub struct DecisionStore {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, Remembered>>,
}

impl DecisionStore {
    /// A store that lives for the process only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or create) a store file and replay it.
    ///
    /// Malformed lines are logged and skipped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store_err = |source| GateError::Store {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(store_err)?;
        }

        let mut entries = HashMap::new();
        if path.exists() {
            let file = fs::File::open(&path).map_err(store_err)?;
            for (number, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(store_err)?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Record>(&line) {
                    Ok(record) => apply(&mut entries, record.key, record.action),
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = number + 1,
                            error = %e,
                            "skipping malformed decision record"
                        );
                    }
                }
            }
        }

        tracing::debug!(path = %path.display(), remembered = entries.len(), "decision store loaded");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Backing file, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The remembered decision for `key`.
    pub fn lookup(&self, key: &str) -> Option<Remembered> {
        self.entries.lock().get(key).copied()
    }

    /// Remember a decision for `key`.
    pub fn remember(&self, key: &str, decision: Remembered) -> Result<()> {
        let action = match decision {
            Remembered::Allow => Action::Allow,
            Remembered::Deny => Action::Deny,
        };
        let mut entries = self.entries.lock();
        if entries.get(key) == Some(&decision) {
            return Ok(());
        }
        self.append(key, action)?;
        apply(&mut entries, key.to_string(), action);
        Ok(())
    }

    /// Drop the remembered decision for `key`. Returns whether one existed.
    pub fn forget(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(key) {
            return Ok(false);
        }
        self.append(key, Action::Forget)?;
        entries.remove(key);
        Ok(true)
    }

    /// All remembered decisions, sorted by key.
    pub fn entries(&self) -> Vec<(String, Remembered)> {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of remembered decisions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn append(&self, key: &str, action: Action) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let store_err = |source| GateError::Store {
            path: path.clone(),
            source,
        };

        let record = Record {
            key: key.to_string(),
            action,
            at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| store_err(std::io::Error::other(e)))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(store_err)?;
        file.write_all(line.as_bytes()).map_err(store_err)?;
        file.sync_all().map_err(store_err)?;
        Ok(())
    }
}

impl std::fmt::Debug for DecisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionStore")
            .field("path", &self.path)
            .field("remembered", &self.len())
            .finish()
    }
}

fn apply(entries: &mut HashMap<String, Remembered>, key: String, action: Action) {
    match action {
        Action::Allow => {
            entries.insert(key, Remembered::Allow);
        }
        Action::Deny => {
            entries.insert(key, Remembered::Deny);
        }
        Action::Forget => {
            entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_types::ToolCategory;
    use serde_json::json;

    fn descriptor() -> ToolDescriptor {
        ToolDescriptor::local("fs_write_file", "", json!({}), ToolCategory::FileWrite)
    }

    #[test]
    fn test_decision_key_scopes() {
        let mut args = Arguments::new();
        args.insert("path".into(), json!("a.txt"));
        args.insert("content".into(), json!("x"));

        assert_eq!(
            decision_key(&descriptor(), &args, AlwaysAllowScope::Capability),
            "fs_write_file"
        );
        assert_eq!(
            decision_key(&descriptor(), &args, AlwaysAllowScope::CapabilityAndArguments),
            "fs_write_file(content,path)"
        );
        assert_eq!(
            decision_key(&descriptor(), &Arguments::new(), AlwaysAllowScope::CapabilityAndArguments),
            "fs_write_file()"
        );
    }

    #[test]
    fn test_in_memory() {
        let store = DecisionStore::in_memory();
        assert!(store.is_empty());
        store.remember("a", Remembered::Allow).unwrap();
        store.remember("b", Remembered::Deny).unwrap();
        assert_eq!(store.lookup("a"), Some(Remembered::Allow));
        assert_eq!(store.lookup("b"), Some(Remembered::Deny));
        assert_eq!(store.lookup("c"), None);

        assert!(store.forget("a").unwrap());
        assert!(!store.forget("a").unwrap());
        assert_eq!(store.entries(), vec![("b".to_string(), Remembered::Deny)]);
        assert!(store.path().is_none());
    }

    #[test]
    fn test_replay_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("decisions.jsonl");

        let store = DecisionStore::open(&path).unwrap();
        store.remember("x", Remembered::Allow).unwrap();
        store.remember("x", Remembered::Deny).unwrap();
        store.remember("y", Remembered::Allow).unwrap();
        store.forget("y").unwrap();
        drop(store);

        let reopened = DecisionStore::open(&path).unwrap();
        assert_eq!(reopened.lookup("x"), Some(Remembered::Deny));
        assert_eq!(reopened.lookup("y"), None);
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_repeated_decision_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        let store = DecisionStore::open(&path).unwrap();
        store.remember("x", Remembered::Allow).unwrap();
        store.remember("x", Remembered::Allow).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("\"action\":\"allow\""));
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.jsonl");
        fs::write(
            &path,
            "not json\n\n{\"key\":\"ok\",\"action\":\"allow\",\"at\":\"2025-01-01T00:00:00Z\"}\n{\"key\":1}\n",
        )
        .unwrap();

        let store = DecisionStore::open(&path).unwrap();
        assert_eq!(store.entries(), vec![("ok".to_string(), Remembered::Allow)]);
    }
}
