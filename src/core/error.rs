//! Error handling for hostpulse
//!
//! Every component of the update pipeline has its own error enum so the
//! controller can map a failure onto the right [`UpdateOutcome`] and decide
//! whether it is worth retrying:
//!
//! - [`FetchError`] - talking to the version server and staging the download
//! - [`VerifyError`] - checksum, size and executable-header validation
//! - [`InstallError`] - swapping the binary and restarting into it
//! - [`VersionStoreError`] - reading and writing the persisted version state
//! - [`SampleError`] - a single failed metric read
//!
//! None of these ever escape the update controller: they are recorded in the
//! update history and the agent keeps running. [`AgentError`] is different; it
//! describes conditions that stop the agent from starting at all, and
//! [`user_friendly_error`] renders it (or any other fatal error) with a
//! suggestion for the operator.
//!
//! [`UpdateOutcome`]: crate::version_store::UpdateOutcome

use colored::Colorize;
use semver::Version;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::utils::backoff::Transient;

/// Failures while querying the version server or downloading an artifact.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection failure, timeout or a 5xx response.
    #[error("Network error while {operation}: {message}")]
    NetworkError {
        /// What the fetcher was doing ("checking latest version", "downloading artifact")
        operation: &'static str,
        /// Underlying transport error or HTTP status
        message: String,
    },

    /// The server answered, but not with something we understand.
    #[error("Unexpected response from version server: {reason}")]
    ProtocolError {
        /// Description of the malformed or rejected response
        reason: String,
    },

    /// The transfer ended with a byte count different from the declared size.
    #[error("Truncated transfer: expected {expected} bytes, received {received}")]
    TruncatedTransfer {
        /// Size announced by the version server
        expected: u64,
        /// Bytes actually received (or announced by Content-Length)
        received: u64,
    },

    /// Writing the staged artifact failed.
    #[error("Disk error while {operation}: {source}")]
    DiskError {
        /// What the fetcher was doing
        operation: &'static str,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Maps a `reqwest` failure onto the fetch taxonomy.
    ///
    /// Timeouts and connection errors are network errors; a body that cannot
    /// be decoded is a protocol error.
    pub(crate) fn from_reqwest(operation: &'static str, error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::ProtocolError {
                reason: error.to_string(),
            }
        } else if error.is_timeout() {
            Self::NetworkError {
                operation,
                message: format!("timed out ({error})"),
            }
        } else {
            Self::NetworkError {
                operation,
                message: error.to_string(),
            }
        }
    }

    pub(crate) const fn disk(operation: &'static str, source: io::Error) -> Self {
        Self::DiskError {
            operation,
            source,
        }
    }
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::TruncatedTransfer { .. })
    }
}

/// Failures while validating a staged artifact.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// SHA-256 of the staged file differs from the declared checksum.
    #[error("Checksum verification failed: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// Checksum announced by the version server (normalized)
        expected: String,
        /// Checksum computed over the staged file
        actual: String,
    },

    /// The artifact is not something this host can run.
    #[error("Invalid artifact: {reason}")]
    InvalidArtifact {
        /// Why the artifact was rejected
        reason: String,
    },

    /// Reading the staged file failed.
    #[error("Disk error while {operation}: {source}")]
    DiskError {
        /// What the verifier was doing
        operation: &'static str,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Failures while replacing the installed binary or restarting into it.
#[derive(Error, Debug)]
pub enum InstallError {
    /// File system failure during backup, permission setup or rename.
    #[error("Disk error while {operation} ({}): {source}", path.display())]
    DiskError {
        /// What the installer was doing
        operation: &'static str,
        /// Path being operated on
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The agent lacks the rights to replace the binary.
    #[error("Permission denied while {operation} ({})", path.display())]
    PermissionError {
        /// What the installer was doing
        operation: &'static str,
        /// Path being operated on
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Another process held the install lock for too long.
    #[error("Timed out after {timeout:?} waiting for the install lock")]
    LockTimeout {
        /// How long we waited
        timeout: Duration,
    },

    /// The version on disk is already at or past the candidate, typically
    /// because another process changed it since the cycle started.
    #[error("Version {current} is installed; refusing to replace it with {candidate}")]
    Superseded {
        /// Version recorded on disk when the lock was taken
        current: Version,
        /// Version the cycle tried to install
        candidate: Version,
    },

    /// Re-executing the installed binary failed.
    #[error("Failed to restart into {}: {source}", program.display())]
    RestartFailed {
        /// Binary we tried to execute
        program: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl InstallError {
    /// Classifies an I/O failure, separating permission problems from the rest.
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionError {
                operation,
                path,
                source,
            }
        } else {
            Self::DiskError {
                operation,
                path,
                source,
            }
        }
    }
}

/// Failures of the persisted version state and update history.
#[derive(Error, Debug)]
pub enum VersionStoreError {
    /// Reading or writing a state file failed.
    #[error("Failed to {operation} {}: {source}", path.display())]
    Io {
        /// What the store was doing ("read", "write", "append to")
        operation: &'static str,
        /// File being operated on
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The state file exists but cannot be parsed.
    #[error("Corrupt version state in {}: {reason}", path.display())]
    Corrupt {
        /// State file path
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// A commit would move the current version backwards.
    #[error("Refusing to move current version from {current} back to {requested}")]
    Regression {
        /// Version currently recorded
        current: Version,
        /// Version the caller tried to commit
        requested: Version,
    },

    /// Rollback requested but no previous version was ever recorded.
    #[error("No previous version recorded")]
    NoPreviousVersion,
}

/// A single metric could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to read {metric}: {reason}")]
pub struct SampleError {
    /// Metric name ("cpu", "memory", "disk")
    pub metric: &'static str,
    /// Why the read failed
    pub reason: String,
}

impl SampleError {
    pub fn new(metric: &'static str, reason: impl Into<String>) -> Self {
        Self {
            metric,
            reason: reason.into(),
        }
    }
}

/// Conditions that prevent the agent from starting.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Required setting missing or invalid.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// What is wrong with the configuration
        message: String,
    },

    /// The config file could not be read or parsed.
    #[error("Invalid config file {}: {reason}", path.display())]
    ConfigFileError {
        /// Config file path
        path: PathBuf,
        /// Read or parse error
        reason: String,
    },

    /// The directory holding the binary does not accept writes.
    #[error("Install path {} is not writable: {reason}", path.display())]
    InstallPathNotWritable {
        /// Configured install path
        path: PathBuf,
        /// Underlying error
        reason: String,
    },

    /// `--rollback` without a backup next to the binary.
    #[error("No backup found at {}", path.display())]
    NoBackup {
        /// Expected backup location
        path: PathBuf,
    },

    /// `--rollback` with a backup but no recorded version to return to.
    #[error("Cannot roll back from {current}: no previous version is recorded")]
    NoRollbackTarget {
        /// Version currently recorded
        current: Version,
    },

    /// Persisted version state could not be opened.
    #[error(transparent)]
    Store(#[from] VersionStoreError),
}

/// A fatal error together with operator-facing guidance.
///
/// Built by [`user_friendly_error`] and printed by `main` right before the
/// process exits with status 1.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: anyhow::Error,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    #[must_use]
    pub const fn new(error: anyhow::Error) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error to stderr with colors.
    pub fn display(&self) {
        eprintln!("{}: {:#}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

/// Attach a suggestion to a fatal error based on its type.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    let suggestion = match error.downcast_ref::<AgentError>() {
        Some(AgentError::ConfigError { .. }) => Some(
            "Set the value in the config file, with a command-line flag, or through its HOSTPULSE_* environment variable",
        ),
        Some(AgentError::ConfigFileError { .. }) => {
            Some("Check the TOML syntax; durations are written like \"10s\" or \"1h\"")
        }
        Some(AgentError::InstallPathNotWritable { .. }) => Some(
            "Run the agent as a user that owns the install directory, or point --install-path somewhere writable",
        ),
        Some(AgentError::NoBackup { .. }) => {
            Some("A backup is only kept after an update installed with upgrade.keep_backup enabled")
        }
        Some(AgentError::NoRollbackTarget { .. }) => Some(
            "The version of the backup binary is unknown, so the binary was left in place; replace it by hand if needed",
        ),
        Some(AgentError::Store(_)) => Some(
            "Inspect or remove the .state.json file next to the binary; it is recreated from the running version",
        ),
        None => None,
    };

    let ctx = ErrorContext::new(error);
    match suggestion {
        Some(suggestion) => ctx.with_suggestion(suggestion),
        None => {
            let permission_denied = ctx.error.chain().any(|cause| {
                cause
                    .downcast_ref::<io::Error>()
                    .is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied)
            });
            if permission_denied {
                ctx.with_suggestion("Check file ownership and permissions of the install directory")
                    .with_details("hostpulse could not read or write one of its files")
            } else {
                ctx
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_transience() {
        let network = FetchError::NetworkError {
            operation: "checking latest version",
            message: "connection refused".to_string(),
        };
        let truncated = FetchError::TruncatedTransfer {
            expected: 10,
            received: 4,
        };
        let protocol = FetchError::ProtocolError {
            reason: "missing field `version`".to_string(),
        };
        let disk = FetchError::disk("writing staged artifact", io::Error::other("disk full"));

        assert!(network.is_transient());
        assert!(truncated.is_transient());
        assert!(!protocol.is_transient());
        assert!(!disk.is_transient());
    }

    #[test]
    fn test_install_error_classifies_permission_denied() {
        let err = InstallError::io(
            "replacing binary",
            "/usr/local/bin/hostpulse",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, InstallError::PermissionError { .. }));

        let err = InstallError::io("replacing binary", "/tmp/x", io::Error::other("boom"));
        assert!(matches!(err, InstallError::DiskError { .. }));
    }

    #[test]
    fn test_error_messages() {
        let err = VerifyError::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(err.to_string(), "Checksum verification failed: expected aa, actual bb");

        let err = AgentError::InstallPathNotWritable {
            path: PathBuf::from("/opt/hostpulse/hostpulse"),
            reason: "read-only file system".to_string(),
        };
        assert!(err.to_string().contains("/opt/hostpulse/hostpulse"));
        assert!(err.to_string().contains("not writable"));
    }

    #[test]
    fn test_user_friendly_error_adds_suggestion() {
        let err = anyhow::Error::new(AgentError::ConfigError {
            message: "version_server_url is required".to_string(),
        });
        let ctx = user_friendly_error(err);
        assert!(ctx.suggestion.is_some());
        assert!(ctx.to_string().contains("version_server_url is required"));
    }

    #[test]
    fn test_user_friendly_error_sees_through_context() {
        let err = anyhow::Error::new(AgentError::NoBackup {
            path: PathBuf::from("/opt/hostpulse/hostpulse.backup"),
        })
        .context("rollback failed");
        let ctx = user_friendly_error(err);
        assert!(ctx.suggestion.is_some());
    }

    #[test]
    fn test_user_friendly_error_permission_fallback() {
        let err = anyhow::Error::new(io::Error::from(io::ErrorKind::PermissionDenied))
            .context("opening state file");
        let ctx = user_friendly_error(err);
        assert!(ctx.suggestion.is_some());
        assert!(ctx.details.is_some());
    }

    #[test]
    fn test_user_friendly_error_plain() {
        let ctx = user_friendly_error(anyhow::anyhow!("something odd"));
        assert!(ctx.suggestion.is_none());
        assert_eq!(ctx.to_string(), "something odd");
    }
}
