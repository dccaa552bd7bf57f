//! Global constants used throughout the hostpulse codebase.
//!
//! Timeouts, retry parameters, default intervals and the file names used for
//! the agent's on-disk state. Defining them centrally keeps magic numbers
//! discoverable and lets tests refer to the same values as production code.

use std::time::Duration;

/// Version embedded in this binary at build time.
///
/// Used to bootstrap the version store on first start and to reconcile it on
/// every later start.
pub const EMBEDDED_VERSION: &str = env!("CARGO_PKG_VERSION");

/// [`EMBEDDED_VERSION`] parsed; `0.0.0` if the package version is not semver.
pub fn embedded_version() -> semver::Version {
    semver::Version::parse(EMBEDDED_VERSION).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

/// Default interval between update checks (1 hour).
pub const DEFAULT_UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Default interval between metric samples (10 seconds).
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Timeout for a single `/latest` query (10 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for downloading one artifact (10 minutes).
///
/// Covers the whole transfer, not a single chunk, so slow links with large
/// binaries may need a larger value.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Attempts per stage (check, download) before a cycle is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// First retry delay of an update stage; doubled on every further attempt.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Upper bound for a single retry delay of an update stage.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exit code used in `exit` restart mode (`EX_TEMPFAIL`).
///
/// A supervisor configured to relaunch on failure picks up the new binary.
pub const DEFAULT_RESTART_EXIT_CODE: i32 = 75;

/// Default timeout for acquiring the install lock (30 seconds).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum backoff delay while polling the install lock (500ms).
pub const MAX_BACKOFF_DELAY_MS: u64 = 500;

/// Starting delay while polling the install lock (10ms).
pub const STARTING_BACKOFF_DELAY_MS: u64 = 10;

/// Number of history records shown by `--status`.
pub const STATUS_HISTORY_LIMIT: usize = 10;

/// Directory under the home directory holding the default config file.
pub const CONFIG_DIR_NAME: &str = ".hostpulse";

/// Name of the default config file.
pub const CONFIG_FILE_NAME: &str = "config.toml";
