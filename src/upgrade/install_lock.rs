//! Cross-process lock around binary replacement.
//!
//! The agent's update cycle and an operator's `hostpulse --rollback` both
//! rename files over the install path. They take this lock first so the two
//! can never interleave. The lock is held through an OS file lock on
//! `.<bin>.lock`, released when the [`InstallLock`] is dropped or the
//! process dies.
//!
//! All file operations run in `spawn_blocking` so waiting on a contended
//! lock never stalls a runtime worker (and with it the monitor loop).

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

use crate::constants::{MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS};
use crate::core::InstallError;

#[derive(Debug)]
pub struct InstallLock {
    _file: Arc<File>,
    lock_path: PathBuf,
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        debug!(path = %self.lock_path.display(), "Install lock released");
    }
}

impl InstallLock {
    /// Acquire the lock, polling with exponential backoff until `timeout`.
    ///
    /// # Errors
    ///
    /// [`InstallError::LockTimeout`] if another process still holds the lock
    /// after `timeout`; a disk or permission error if the lock file cannot be
    /// opened.
    pub async fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, InstallError> {
        debug!(path = %lock_path.display(), "Waiting for install lock");

        let open_path = lock_path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new().create(true).write(true).truncate(false).open(&open_path)
        })
        .await
        .map_err(|e| InstallError::io("opening install lock", lock_path, std::io::Error::other(e)))?
        .map_err(|e| InstallError::io("opening install lock", lock_path, e))?;
        let file = Arc::new(file);

        let start = Instant::now();

        // 10ms, 100ms, then capped at 500ms
        let backoff = ExponentialBackoff::from_millis(STARTING_BACKOFF_DELAY_MS)
            .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS));

        for delay in backoff {
            let candidate = Arc::clone(&file);
            let acquired = tokio::task::spawn_blocking(move || candidate.try_lock_exclusive())
                .await
                .map_err(|e| {
                    InstallError::io("locking install lock", lock_path, std::io::Error::other(e))
                })?;

            match acquired {
                Ok(true) => {
                    debug!(
                        path = %lock_path.display(),
                        wait_ms = start.elapsed().as_millis() as u64,
                        "Install lock acquired"
                    );
                    return Ok(Self {
                        _file: file,
                        lock_path: lock_path.to_path_buf(),
                    });
                }
                Ok(false) | Err(_) => {
                    let remaining = timeout.saturating_sub(start.elapsed());
                    if remaining.is_zero() {
                        return Err(InstallError::LockTimeout { timeout });
                    }
                    tokio::time::sleep(delay.min(remaining)).await;
                }
            }
        }

        Err(InstallError::LockTimeout { timeout })
    }
}
