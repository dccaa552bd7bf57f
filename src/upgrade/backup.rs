use std::io;
use std::path::{Path, PathBuf};
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info, warn};

use crate::config::InstallLayout;
use crate::core::InstallError;
use crate::utils::fs::{parent_dir, sync_dir};

/// Keeps a copy of the previous binary next to the installed one.
///
/// Before an update replaces the binary, the installer copies it to
/// `<bin>.backup`. An operator can later run `hostpulse --rollback` to put
/// that copy back.
///
/// Both directions go through a temporary file in the same directory that is
/// renamed into place, so neither the backup nor the live binary is ever
/// observed half-written. In particular, restoring never deletes the live
/// binary before its replacement is complete.
///
/// # Platform Behavior
///
/// - **Unix**: permissions of the source file are carried over to the copy.
/// - **All platforms**: a failed restore is retried twice, a second apart,
///   unless the backup is missing. On Windows a freshly replaced executable
///   can stay locked for a moment by scanners or the loader.
const RESTORE_RETRY_DELAY_MS: u64 = 1000;
const RESTORE_RETRIES: usize = 2;

#[derive(Debug, Clone)]
pub struct BackupManager {
    /// Path to the installed binary.
    original_path: PathBuf,
    /// Path where the backup is stored.
    backup_path: PathBuf,
}

impl BackupManager {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            original_path: layout.install_path().to_path_buf(),
            backup_path: layout.backup_file(),
        }
    }

    /// Copy the installed binary to the backup location, replacing any
    /// earlier backup.
    ///
    /// # Errors
    ///
    /// Fails if the installed binary is missing or unreadable, or if the copy
    /// cannot be written.
    pub async fn create_backup(&self) -> Result<(), InstallError> {
        info!("Creating backup at {:?}", self.backup_path);
        copy_atomically(&self.original_path, &self.backup_path)
            .await
            .map_err(|e| InstallError::io("creating backup", &self.backup_path, e))?;
        debug!("Backup created successfully");
        Ok(())
    }

    /// Put the backup back in place of the installed binary.
    ///
    /// The backup itself is kept, so a failed restore can simply be repeated.
    pub async fn restore_backup(&self) -> Result<(), InstallError> {
        warn!("Restoring from backup at {:?}", self.backup_path);

        let strategy = FixedInterval::from_millis(RESTORE_RETRY_DELAY_MS).take(RESTORE_RETRIES);
        RetryIf::spawn(
            strategy,
            || copy_atomically(&self.backup_path, &self.original_path),
            |e: &io::Error| {
                let retry = e.kind() != io::ErrorKind::NotFound;
                if retry {
                    warn!("Restore attempt failed: {}. Retrying...", e);
                }
                retry
            },
        )
        .await
        .map_err(|e| InstallError::io("restoring backup", &self.original_path, e))?;

        info!("Successfully restored from backup");
        Ok(())
    }

    pub fn backup_exists(&self) -> bool {
        self.backup_path.is_file()
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }
}

/// Copy `from` to `to` through a temporary sibling of `to` and a rename.
async fn copy_atomically(from: &Path, to: &Path) -> io::Result<()> {
    let from = from.to_path_buf();
    let to = to.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = parent_dir(&to);
        let temp = tempfile::Builder::new().prefix(".copy-").tempfile_in(dir)?;
        std::fs::copy(&from, temp.path())?;
        temp.as_file().sync_all()?;
        temp.persist(&to).map_err(|e| e.error)?;
        sync_dir(dir)
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> BackupManager {
        BackupManager::new(&InstallLayout::new(temp.path().join("hostpulse")))
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("hostpulse");
        std::fs::write(&binary, b"version 1").unwrap();
        let manager = manager(&temp);

        manager.create_backup().await.unwrap();
        assert!(manager.backup_exists());
        assert_eq!(manager.backup_path(), temp.path().join("hostpulse.backup"));

        std::fs::write(&binary, b"version 2").unwrap();
        manager.restore_backup().await.unwrap();
        assert_eq!(std::fs::read(&binary).unwrap(), b"version 1");
        // backup survives a restore
        assert!(manager.backup_exists());
    }

    #[tokio::test]
    async fn test_backup_without_original_fails() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp);

        assert!(manager.create_backup().await.is_err());
        assert!(!manager.backup_exists());
    }

    #[tokio::test]
    async fn test_restore_without_backup_leaves_binary() {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("hostpulse");
        std::fs::write(&binary, b"current").unwrap();

        assert!(manager(&temp).restore_backup().await.is_err());
        assert_eq!(std::fs::read(&binary).unwrap(), b"current");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restore_retries_until_target_is_writable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("hostpulse");
        std::fs::write(&binary, b"version 1").unwrap();
        let manager = manager(&temp);
        manager.create_backup().await.unwrap();
        std::fs::write(&binary, b"version 2").unwrap();

        // a read-only directory blocks the first attempt; unblock it shortly after
        std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o555)).unwrap();
        let write_check = temp.path().join(".write-check");
        if std::fs::write(&write_check, b"").is_ok() {
            // running as root: permissions are not enforced
            std::fs::remove_file(&write_check).unwrap();
            std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let dir = temp.path().to_path_buf();
        let unblock = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        });

        manager.restore_backup().await.unwrap();
        unblock.await.unwrap();
        assert_eq!(std::fs::read(&binary).unwrap(), b"version 1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backup_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("hostpulse");
        std::fs::write(&binary, b"bin").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o750)).unwrap();

        let manager = manager(&temp);
        manager.create_backup().await.unwrap();

        let mode = std::fs::metadata(manager.backup_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
