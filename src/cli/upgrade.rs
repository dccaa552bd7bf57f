use anyhow::{Context, Result};
use colored::Colorize;
use tracing::warn;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::constants::{STATUS_HISTORY_LIMIT, embedded_version};
use crate::core::{AgentError, VersionStoreError};
use crate::upgrade::backup::BackupManager;
use crate::upgrade::install_lock::InstallLock;
use crate::upgrade::{ReleaseSource, Staging, UpdateFetcher};
use crate::version_store::{UpdateOutcome, UpdateRecord, VersionStore};

/// `--status`: recorded versions plus the tail of the update history.
pub async fn show_status(config: &AgentConfig) -> Result<()> {
    let layout = config.layout();
    let store = VersionStore::open(&layout, &embedded_version())?;

    println!("{} {}", "Current version:".bold(), store.current_version());
    match store.previous_version() {
        Some(previous) => println!("{} {}", "Previous version:".bold(), previous),
        None => println!("{} {}", "Previous version:".bold(), "none".dimmed()),
    }
    println!("{} {}", "Install path:".bold(), layout.install_path().display());
    let backup = BackupManager::new(&layout);
    if backup.backup_exists() {
        println!("{} {}", "Backup:".bold(), backup.backup_path().display());
    }

    let history = store.recent_history(STATUS_HISTORY_LIMIT)?;
    if history.is_empty() {
        println!("{}", "No updates recorded".dimmed());
        return Ok(());
    }

    println!("{}", "Recent updates:".bold());
    for record in &history {
        let target = record
            .to_version
            .as_ref()
            .map_or_else(|| "?".to_string(), ToString::to_string);
        let outcome = match record.outcome {
            UpdateOutcome::Success => record.outcome.to_string().green(),
            UpdateOutcome::RolledBack => record.outcome.to_string().yellow(),
            _ => record.outcome.to_string().red(),
        };
        let line = format!(
            "  {}  {} -> {}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.from_version,
            target,
            outcome
        );
        match &record.detail {
            Some(detail) => println!("{line}  ({detail})"),
            None => println!("{line}"),
        }
    }
    Ok(())
}

/// `--check`: one query against the version server.
pub async fn check_for_updates(config: &AgentConfig) -> Result<()> {
    let layout = config.layout();
    let store = VersionStore::open(&layout, &embedded_version())?;
    let current = store.current_version();

    println!("{}", "Checking for updates...".cyan());
    let fetcher = UpdateFetcher::new(
        config.version_server_url.clone(),
        Staging::new(&layout),
        &config.upgrade,
    )?;
    let release = fetcher.latest_release().await.context("Failed to check for updates")?;

    if release.version > *current {
        println!(
            "{}",
            format!("Update available: {} -> {}", current, release.version).green()
        );
        if !config.upgrade.enabled {
            println!("Automatic updates are disabled; enable upgrade.enabled to install it");
        }
    } else {
        println!("{}", format!("You are on the latest version ({current})").green());
    }
    Ok(())
}

/// `--rollback`: restore `<bin>.backup` and move the recorded version back.
///
/// The older version is committed before the binary is restored. A crash in
/// between leaves the newer binary with an older record, which the next start
/// of that binary raises again; the reverse order would leave an older binary
/// with a record that never comes down.
pub async fn rollback(config: &AgentConfig) -> Result<()> {
    let layout = config.layout();
    let backup = BackupManager::new(&layout);
    if !backup.backup_exists() {
        return Err(AgentError::NoBackup {
            path: backup.backup_path().to_path_buf(),
        }
        .into());
    }

    let _lock = InstallLock::acquire(&layout.lock_file(), config.upgrade.lock_timeout).await?;

    let mut store = VersionStore::open(&layout, &embedded_version())?;
    let replaced = match store.commit_rollback().await {
        Ok(replaced) => replaced,
        Err(VersionStoreError::NoPreviousVersion) => {
            return Err(AgentError::NoRollbackTarget {
                current: store.current_version().clone(),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };
    let target = store.current_version().clone();

    println!("{}", format!("Rolling back {replaced} -> {target}...").yellow());
    if let Err(e) = backup.restore_backup().await {
        // the live binary is still `replaced`; put the record back in line with it
        if let Err(revert) = store.commit_install(&replaced).await {
            warn!(error = %revert, "Could not restore the version record after a failed rollback");
        }
        return Err(e).context("Failed to restore from backup");
    }

    let record = UpdateRecord::new(
        Uuid::new_v4(),
        replaced.clone(),
        Some(target.clone()),
        UpdateOutcome::RolledBack,
    );
    store.append(&record).await?;

    println!("{}", format!("Rolled back {replaced} -> {target}").green());
    Ok(())
}
