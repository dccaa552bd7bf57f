//! The `hostpulse` binary's one-shot modes and startup failures.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use hostpulse::config::InstallLayout;
use hostpulse::test_utils::fake_binary;
use hostpulse::version_store::VersionStore;
use predicates::prelude::*;
use semver::Version;
use tempfile::TempDir;

use crate::common::VersionServer;

/// A command isolated from the caller's environment and home directory.
fn hostpulse(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("hostpulse").unwrap();
    for var in [
        "HOSTPULSE_CONFIG",
        "HOSTPULSE_SERVER_URL",
        "HOSTPULSE_INSTALL_PATH",
        "HOSTPULSE_UPDATE_INTERVAL",
        "HOSTPULSE_MONITOR_INTERVAL",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("HOME", home).env("NO_COLOR", "1");
    cmd
}

fn install_binary(temp: &TempDir, version: &str) -> PathBuf {
    let path = temp.path().join("hostpulse");
    std::fs::write(&path, fake_binary(version)).unwrap();
    path
}

#[test]
fn test_missing_server_url_is_fatal() {
    let temp = TempDir::new().unwrap();
    let install_path = install_binary(&temp, "1.0.0");

    hostpulse(temp.path())
        .arg("--install-path")
        .arg(&install_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("version_server_url"));
}

#[test]
fn test_invalid_config_file_is_fatal() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("config.toml");
    std::fs::write(&config, "version_server_url = [unterminated").unwrap();

    hostpulse(temp.path())
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid config file"));
}

#[test]
fn test_unwritable_install_dir_is_fatal() {
    let temp = TempDir::new().unwrap();
    let install_path = temp.path().join("missing").join("hostpulse");

    hostpulse(temp.path())
        .args(["--server-url", "http://127.0.0.1:9/"])
        .arg("--install-path")
        .arg(&install_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not writable"));
}

#[test]
fn test_status_reports_running_version() {
    let temp = TempDir::new().unwrap();
    let install_path = install_binary(&temp, env!("CARGO_PKG_VERSION"));

    hostpulse(temp.path())
        .args(["--server-url", "http://127.0.0.1:9/", "--status"])
        .arg("--install-path")
        .arg(&install_path)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "Current version: {}",
            env!("CARGO_PKG_VERSION")
        )))
        .stdout(predicate::str::contains("No updates recorded"));
}

#[test]
fn test_rollback_without_backup_fails() {
    let temp = TempDir::new().unwrap();
    let install_path = install_binary(&temp, "1.0.0");

    hostpulse(temp.path())
        .args(["--server-url", "http://127.0.0.1:9/", "--rollback"])
        .arg("--install-path")
        .arg(&install_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("No backup found"));
}

#[test]
fn test_rollback_restores_backup() {
    let temp = TempDir::new().unwrap();
    let install_path = install_binary(&temp, "2.0.0");
    std::fs::write(temp.path().join("hostpulse.backup"), fake_binary("1.0.0")).unwrap();
    std::fs::write(
        temp.path().join(".hostpulse.state.json"),
        r#"{"current_version":"2.0.0","previous_version":"1.0.0","updated_at":"2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    hostpulse(temp.path())
        .args(["--server-url", "http://127.0.0.1:9/", "--rollback"])
        .arg("--install-path")
        .arg(&install_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Rolled back 2.0.0 -> 1.0.0"));

    assert_eq!(std::fs::read(&install_path).unwrap(), fake_binary("1.0.0"));
    let state = std::fs::read_to_string(temp.path().join(".hostpulse.state.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(state["current_version"], "1.0.0");
    assert!(state.get("previous_version").is_none());

    // the restored binary starts with a record that matches it
    let layout = InstallLayout::new(&install_path);
    let store = VersionStore::open(&layout, &Version::new(1, 0, 0)).unwrap();
    assert_eq!(store.current_version(), &Version::new(1, 0, 0));
}

#[test]
fn test_rollback_without_recorded_previous_version_is_refused() {
    let temp = TempDir::new().unwrap();
    let install_path = install_binary(&temp, "2.0.0");
    std::fs::write(temp.path().join("hostpulse.backup"), fake_binary("1.0.0")).unwrap();
    let state_file = temp.path().join(".hostpulse.state.json");
    std::fs::write(
        &state_file,
        r#"{"current_version":"2.0.0","updated_at":"2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    hostpulse(temp.path())
        .args(["--server-url", "http://127.0.0.1:9/", "--rollback"])
        .arg("--install-path")
        .arg(&install_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no previous version is recorded"));

    // neither the binary nor the record moved
    assert_eq!(std::fs::read(&install_path).unwrap(), fake_binary("2.0.0"));
    let state = std::fs::read_to_string(&state_file).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(state["current_version"], "2.0.0");
    assert!(temp.path().join("hostpulse.backup").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_check_reports_available_update() {
    let server = VersionServer::start().await;
    server.publish("9.9.9", fake_binary("9.9.9"));
    let url = server.url();

    let temp = TempDir::new().unwrap();
    let install_path = install_binary(&temp, env!("CARGO_PKG_VERSION"));

    let output = tokio::task::spawn_blocking(move || {
        let output = hostpulse(temp.path())
            .args(["--server-url", &url, "--check"])
            .arg("--install-path")
            .arg(&install_path)
            .output()
            .unwrap();
        drop(temp);
        output
    })
    .await
    .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Update available"));
    assert!(stdout.contains("9.9.9"));
    assert_eq!(server.artifact_hits(), 0);
}
