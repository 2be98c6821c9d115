//! CLI integration tests for the Arbiter command-line interface.
//!
//! These run against configs with remote tools disabled, so no tool server
//! is needed.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{NamedTempFile, TempDir};

/// Get a command for the arbiter binary with an isolated config directory.
fn arbiter(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("arbiter").unwrap();
    cmd.env("ARBITER_CONFIG_DIR", config_dir.path())
        .env_remove("ARBITER_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

fn disabled_config() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[pipeline]\nenabled = false\n\n[[servers]]\nname = \"fs\"\nurl = \"ws://127.0.0.1:1\""
    )
    .unwrap();
    file
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    arbiter(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("servers"))
        .stdout(predicate::str::contains("tools"))
        .stdout(predicate::str::contains("call"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn test_version_displays() {
    let dir = TempDir::new().unwrap();
    arbiter(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("arbiter"));
}

#[test]
fn test_call_requires_name() {
    let dir = TempDir::new().unwrap();
    arbiter(&dir).arg("call").assert().failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_servers_with_remote_disabled() {
    let dir = TempDir::new().unwrap();
    let config = disabled_config();
    arbiter(&dir)
        .arg("--config")
        .arg(config.path())
        .arg("servers")
        .assert()
        .success()
        .stdout(predicate::str::contains("Remote tools are disabled"));
}

#[test]
fn test_tools_json_is_empty_list() {
    let dir = TempDir::new().unwrap();
    let config = disabled_config();
    arbiter(&dir)
        .arg("--config")
        .arg(config.path())
        .args(["--json", "tools"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_call_unknown_capability_fails() {
    let dir = TempDir::new().unwrap();
    let config = disabled_config();
    arbiter(&dir)
        .arg("--config")
        .arg(config.path())
        .args(["call", "fs_read_file", "--args", r#"{"path": "a.txt"}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tool_not_found"));
}

#[test]
fn test_call_rejects_bad_arguments() {
    let dir = TempDir::new().unwrap();
    let config = disabled_config();
    arbiter(&dir)
        .arg("--config")
        .arg(config.path())
        .args(["call", "anything", "--args", "[1, 2]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON object"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = TempDir::new().unwrap();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[pipeline\nenabled = ").unwrap();
    arbiter(&dir)
        .arg("--config")
        .arg(file.path())
        .arg("tools")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}
