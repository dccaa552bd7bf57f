//! Atomic binary replacement and restart.
//!
//! An install moves a [`VerifiedArtifact`] over the install path with a single
//! `rename`. Staging lives in the same directory, so the rename is atomic:
//! every observer, including a process that starts after a crash, sees either
//! the complete old binary or the complete new one.
//!
//! Sequence, all under the [`InstallLock`]:
//!
//! 0. re-read the version state, which a `--rollback` in another process
//!    may have changed, and give up if the candidate is no longer newer
//! 1. back up the live binary (when `keep_backup` is on)
//! 2. give the staged file the live binary's permissions (0755 if none)
//! 3. rename it over the install path and sync the directory
//! 4. commit the new current version to the [`VersionStore`]
//!
//! A failure in steps 0-3 leaves the live binary untouched and deletes the
//! staged file. Step 4 runs after the point of no return: if it fails, the
//! install still counts as done and the receipt carries the anomaly.

use std::convert::Infallible;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use semver::Version;
use tracing::{error, info, warn};

use crate::config::InstallLayout;
use crate::core::InstallError;
use crate::upgrade::backup::BackupManager;
use crate::upgrade::config::{RestartMode, UpgradeConfig};
use crate::upgrade::install_lock::InstallLock;
use crate::upgrade::verification::VerifiedArtifact;
use crate::utils::fs::sync_dir;
use crate::version_store::VersionStore;

/// What an install changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub from: Version,
    pub to: Version,
    /// Set when the binary was swapped but the version commit failed.
    pub store_anomaly: Option<String>,
}

/// How to hand over to the new binary.
#[derive(Debug, Clone)]
struct RestartPlan {
    mode: RestartMode,
    exit_code: i32,
    args: Vec<OsString>,
}

#[derive(Debug)]
pub struct Installer {
    layout: InstallLayout,
    backup: Option<BackupManager>,
    lock_timeout: Duration,
    restart: RestartPlan,
}

impl Installer {
    /// Captures the current process arguments for a later [`Installer::restart`].
    pub fn new(layout: InstallLayout, config: &UpgradeConfig) -> Self {
        let args = std::env::args_os().skip(1).collect();
        Self::with_args(layout, config, args)
    }

    /// Like [`Installer::new`] with explicit restart arguments (excluding argv[0]).
    pub fn with_args(layout: InstallLayout, config: &UpgradeConfig, args: Vec<OsString>) -> Self {
        let backup = config.keep_backup.then(|| BackupManager::new(&layout));
        Self {
            layout,
            backup,
            lock_timeout: config.lock_timeout,
            restart: RestartPlan {
                mode: config.restart,
                exit_code: config.restart_exit_code,
                args,
            },
        }
    }

    pub fn install_path(&self) -> &Path {
        self.layout.install_path()
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// Replace the installed binary with `artifact` and record the new version.
    ///
    /// # Errors
    ///
    /// [`InstallError`] if the swap did not happen. The live binary and the
    /// store are unchanged in that case, and the staged file is gone.
    pub async fn install(
        &self,
        artifact: VerifiedArtifact,
        store: &mut VersionStore,
    ) -> Result<InstallReceipt, InstallError> {
        let to = artifact.version().clone();
        let install_path = self.layout.install_path().to_path_buf();

        let _lock = InstallLock::acquire(&self.layout.lock_file(), self.lock_timeout).await?;

        if let Err(e) = store.reload().await {
            warn!(error = %e, "Could not re-read version state, using the last known state");
        }
        let from = store.current_version().clone();
        if to <= from {
            return Err(InstallError::Superseded {
                current: from,
                candidate: to,
            });
        }

        if let Some(backup) = &self.backup {
            if install_path.exists() {
                backup.create_backup().await?;
            }
        }

        let staged = artifact.into_staged().into_temp_path();
        let target = install_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), InstallError> {
            copy_permissions(&target, &staged)?;
            staged
                .persist(&target)
                .map_err(|e| InstallError::io("replacing binary", &target, e.error))?;
            sync_dir(crate::utils::fs::parent_dir(&target))
                .map_err(|e| InstallError::io("syncing install directory", &target, e))
        })
        .await
        .map_err(|e| InstallError::io("replacing binary", &install_path, std::io::Error::other(e)))??;

        info!(from = %from, to = %to, path = %install_path.display(), "Binary replaced");

        let store_anomaly = match store.commit_install(&to).await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    error = %e,
                    installed = %to,
                    "Binary replaced but version commit failed; state will be reconciled on restart"
                );
                Some(e.to_string())
            }
        };

        Ok(InstallReceipt {
            from,
            to,
            store_anomaly,
        })
    }

    /// Hand over to the installed binary. Only returns on failure.
    ///
    /// In [`RestartMode::Exec`] the process image is replaced by the binary at
    /// the install path, with the arguments this process was started with. In
    /// [`RestartMode::Exit`] the process exits with the configured code so a
    /// supervisor can relaunch it.
    pub fn restart(&self) -> Result<Infallible, InstallError> {
        match self.restart.mode {
            RestartMode::Exit => {
                info!(code = self.restart.exit_code, "Exiting for supervisor restart");
                std::process::exit(self.restart.exit_code)
            }
            RestartMode::Exec => self.exec(),
        }
    }

    #[cfg(unix)]
    fn exec(&self) -> Result<Infallible, InstallError> {
        use std::os::unix::process::CommandExt;

        let program = self.layout.install_path();
        info!(program = %program.display(), "Re-executing installed binary");
        let source = std::process::Command::new(program).args(&self.restart.args).exec();
        Err(InstallError::RestartFailed {
            program: program.to_path_buf(),
            source,
        })
    }

    #[cfg(not(unix))]
    fn exec(&self) -> Result<Infallible, InstallError> {
        let program = self.layout.install_path();
        info!(program = %program.display(), "Spawning installed binary");
        let child = std::process::Command::new(program)
            .args(&self.restart.args)
            .spawn()
            .map_err(|source| InstallError::RestartFailed {
                program: program.to_path_buf(),
                source,
            })?;
        info!(pid = child.id(), "Replacement process started");
        std::process::exit(0)
    }
}

#[cfg(unix)]
fn copy_permissions(live: &Path, staged: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match std::fs::metadata(live) {
        Ok(meta) if meta.is_file() => meta.permissions().mode() & 0o7777,
        _ => 0o755,
    };
    std::fs::set_permissions(staged, std::fs::Permissions::from_mode(mode))
        .map_err(|e| InstallError::io("setting permissions", staged, e))
}

#[cfg(not(unix))]
fn copy_permissions(_live: &Path, _staged: &Path) -> Result<(), InstallError> {
    Ok(())
}
