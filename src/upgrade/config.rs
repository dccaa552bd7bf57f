use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_DOWNLOAD_TIMEOUT, DEFAULT_INITIAL_BACKOFF, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_BACKOFF, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RESTART_EXIT_CODE,
};

/// How the agent hands control to a freshly installed binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Replace the process image with the new binary, keeping the arguments.
    #[default]
    Exec,
    /// Exit with `restart_exit_code` and let a supervisor relaunch us.
    Exit,
}

/// Configuration for automatic update behavior.
///
/// Lives under the `[upgrade]` table of the agent config. Every field has a
/// default, so an empty or missing table yields a working setup.
///
/// # Examples
///
/// ```toml
/// [upgrade]
/// enabled = true
/// check_on_startup = true
/// max_attempts = 3
/// initial_backoff = "2s"
/// max_backoff = "5m"
/// request_timeout = "10s"
/// download_timeout = "10m"
/// verify_executable = true
/// keep_backup = true
/// restart = "exec"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Whether the agent checks for and installs updates at all.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run the first update check immediately instead of one interval after start.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub check_on_startup: bool,

    /// Attempts per stage (check, download) before a cycle is abandoned.
    ///
    /// Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt; doubled for every further one.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for a single retry delay. Also never exceeds the check interval.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Timeout for the `/latest` query.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Timeout for a complete artifact download.
    #[serde(default = "default_download_timeout", with = "humantime_serde")]
    pub download_timeout: Duration,

    /// Reject artifacts that do not start with an executable header for this platform.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub verify_executable: bool,

    /// Keep the replaced binary as `<bin>.backup` for manual rollback.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub keep_backup: bool,

    #[serde(default)]
    pub restart: RestartMode,

    /// Exit status used in [`RestartMode::Exit`].
    #[serde(default = "default_restart_exit_code")]
    pub restart_exit_code: i32,

    /// How long an install waits for another process holding the install lock.
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_on_startup: true,
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            request_timeout: default_request_timeout(),
            download_timeout: default_download_timeout(),
            verify_executable: true,
            keep_backup: true,
            restart: RestartMode::default(),
            restart_exit_code: default_restart_exit_code(),
            lock_timeout: default_lock_timeout(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

const fn default_max_backoff() -> Duration {
    DEFAULT_MAX_BACKOFF
}

const fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

const fn default_download_timeout() -> Duration {
    DEFAULT_DOWNLOAD_TIMEOUT
}

const fn default_restart_exit_code() -> i32 {
    DEFAULT_RESTART_EXIT_CODE
}

const fn default_lock_timeout() -> Duration {
    DEFAULT_LOCK_TIMEOUT
}
