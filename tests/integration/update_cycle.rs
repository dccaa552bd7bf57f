//! Update cycles over real HTTP against the local version server.

use std::path::Path;
use std::time::Duration;

use axum::http::StatusCode;
use hostpulse::config::{AgentConfig, ConfigFile, ConfigOverrides, InstallLayout};
use hostpulse::test_utils::{fake_binary, init_test_logging};
use hostpulse::upgrade::{
    ArtifactVerifier, CycleResult, Installer, Staging, UpdateController, UpdateFetcher,
    UpgradeConfig,
};
use hostpulse::utils::ShutdownListener;
use hostpulse::version_store::{UpdateOutcome, VersionStore};
use semver::Version;
use tempfile::TempDir;

use crate::common::VersionServer;

struct Host {
    _temp: TempDir,
    config: AgentConfig,
    layout: InstallLayout,
}

fn host(server: &VersionServer) -> Host {
    init_test_logging(None);
    let temp = TempDir::new().unwrap();
    let install_path = temp.path().join("hostpulse");
    std::fs::write(&install_path, fake_binary("1.0.0")).unwrap();

    let file = ConfigFile {
        upgrade: UpgradeConfig {
            request_timeout: Duration::from_millis(300),
            download_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..UpgradeConfig::default()
        },
        ..ConfigFile::default()
    };
    let overrides = ConfigOverrides {
        version_server_url: Some(server.url()),
        install_path: Some(install_path),
        ..ConfigOverrides::default()
    };
    let config = AgentConfig::resolve(file, overrides).unwrap();
    let layout = config.layout();

    Host {
        _temp: temp,
        config,
        layout,
    }
}

fn controller(host: &Host) -> UpdateController<UpdateFetcher> {
    let config = &host.config;
    let store = VersionStore::open(&host.layout, &Version::new(1, 0, 0)).unwrap();
    let fetcher = UpdateFetcher::new(
        config.version_server_url.clone(),
        Staging::new(&host.layout),
        &config.upgrade,
    )
    .unwrap();

    UpdateController::new(
        fetcher,
        ArtifactVerifier::new(config.upgrade.verify_executable),
        Installer::with_args(host.layout.clone(), &config.upgrade, vec![]),
        store,
        config.retry_policy(),
        ShutdownListener::never(),
    )
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_update_installs_newer_release() {
    let server = VersionServer::start().await;
    server.publish("2.0.0", fake_binary("2.0.0"));
    let host = host(&server);
    let ctl = controller(&host);

    let result = ctl.run_cycle().await;

    assert_eq!(
        result,
        CycleResult::Installed {
            from: Version::new(1, 0, 0),
            to: Version::new(2, 0, 0)
        }
    );
    assert_eq!(std::fs::read(host.layout.install_path()).unwrap(), fake_binary("2.0.0"));
    assert_eq!(std::fs::read(host.layout.backup_file()).unwrap(), fake_binary("1.0.0"));
    assert_eq!(staged_files(&host.layout.staging_dir()), 0);

    let state = std::fs::read_to_string(host.layout.state_file()).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(state["current_version"], "2.0.0");
    assert_eq!(state["previous_version"], "1.0.0");

    let history = std::fs::read_to_string(host.layout.history_file()).unwrap();
    assert_eq!(history.lines().count(), 1);
    assert!(history.contains("\"success\""));
}

#[tokio::test]
async fn test_checksum_mismatch_is_rejected() {
    let server = VersionServer::start().await;
    server.publish("2.0.0", fake_binary("2.0.0"));
    server.announce_checksum(&"0".repeat(64));
    let host = host(&server);
    let ctl = controller(&host);

    let result = ctl.run_cycle().await;

    assert_eq!(result, CycleResult::Failed(UpdateOutcome::VerificationFailed));
    assert_eq!(ctl.current_version().await, Version::new(1, 0, 0));
    assert_eq!(std::fs::read(host.layout.install_path()).unwrap(), fake_binary("1.0.0"));
    assert_eq!(staged_files(&host.layout.staging_dir()), 0);
}

#[tokio::test]
async fn test_latest_timeouts_abandon_cycle() {
    let server = VersionServer::start().await;
    server.publish("2.0.0", fake_binary("2.0.0"));
    server.hang_latest(3);
    let host = host(&server);
    let ctl = controller(&host);

    let result = ctl.run_cycle().await;

    assert_eq!(result, CycleResult::Failed(UpdateOutcome::DownloadFailed));
    assert_eq!(server.latest_hits(), 3);
    assert_eq!(server.artifact_hits(), 0);
    {
        let store = ctl.store().await;
        let history = store.history().unwrap();
        assert!(history[0].detail.as_deref().unwrap().starts_with("checking:"));
        assert!(history[0].to_version.is_none());
    }

    // the next tick starts from scratch and succeeds
    assert!(matches!(ctl.run_cycle().await, CycleResult::Installed { .. }));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = VersionServer::start().await;
    server.publish("2.0.0", fake_binary("2.0.0"));
    server.fail_latest(2, StatusCode::SERVICE_UNAVAILABLE);
    let host = host(&server);
    let ctl = controller(&host);

    assert!(matches!(ctl.run_cycle().await, CycleResult::Installed { .. }));
    assert_eq!(server.latest_hits(), 3);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = VersionServer::start().await;
    server.publish("2.0.0", fake_binary("2.0.0"));
    server.fail_latest(5, StatusCode::NOT_FOUND);
    let host = host(&server);
    let ctl = controller(&host);

    let result = ctl.run_cycle().await;

    assert_eq!(result, CycleResult::Failed(UpdateOutcome::DownloadFailed));
    assert_eq!(server.latest_hits(), 1);
}

#[tokio::test]
async fn test_malformed_latest_is_not_retried() {
    let server = VersionServer::start().await;
    server.malformed_latest("{\"version\": ");
    let host = host(&server);
    let ctl = controller(&host);

    let result = ctl.run_cycle().await;

    assert_eq!(result, CycleResult::Failed(UpdateOutcome::DownloadFailed));
    assert_eq!(server.latest_hits(), 1);
}

#[tokio::test]
async fn test_size_mismatch_is_truncated_transfer() {
    let server = VersionServer::start().await;
    let payload = fake_binary("2.0.0");
    let announced = payload.len() as u64 + 100;
    server.publish("2.0.0", payload);
    server.announce_size(announced);
    let host = host(&server);
    let ctl = controller(&host);

    let result = ctl.run_cycle().await;

    assert_eq!(result, CycleResult::Failed(UpdateOutcome::DownloadFailed));
    // truncated transfers are transient, so every attempt downloads again
    assert_eq!(server.artifact_hits(), host.config.upgrade.max_attempts);
    assert_eq!(staged_files(&host.layout.staging_dir()), 0);
    assert_eq!(std::fs::read(host.layout.install_path()).unwrap(), fake_binary("1.0.0"));

    let history = ctl.store().await.history().unwrap();
    assert!(history[0].detail.as_deref().unwrap().contains("Truncated transfer"));
}

#[tokio::test]
async fn test_same_version_is_up_to_date() {
    let server = VersionServer::start().await;
    server.publish("v1.0.0", fake_binary("1.0.0"));
    let host = host(&server);
    let ctl = controller(&host);

    assert_eq!(ctl.run_cycle().await, CycleResult::UpToDate);
    assert_eq!(server.artifact_hits(), 0);
}

#[tokio::test]
async fn test_current_version_never_decreases() {
    let server = VersionServer::start().await;
    let host = host(&server);

    let mut seen = Vec::new();
    for version in ["1.1.0", "1.0.5", "1.2.0", "0.9.0"] {
        server.publish(version, fake_binary(version));
        // a fresh controller per round, as after each restart
        let ctl = controller(&host);
        ctl.run_cycle().await;
        seen.push(ctl.current_version().await);
    }

    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(seen.last(), Some(&Version::new(1, 2, 0)));
}
