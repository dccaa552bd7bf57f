//! Durable version state and update history.
//!
//! The store owns the only state the agent persists across restarts:
//!
//! - `.<bin>.state.json` holds the current and previous version. It is
//!   replaced atomically on every change, so a crash leaves either the old
//!   or the new state on disk.
//! - `.<bin>.history.jsonl` is an append-only log of [`UpdateRecord`]s, one
//!   JSON object per line. Records are never rewritten.
//!
//! Both files live next to the installed binary (see [`InstallLayout`]).
//!
//! # Version invariants
//!
//! The current version only moves forward through [`VersionStore::commit_install`];
//! the sole way back is an explicit operator rollback
//! ([`VersionStore::commit_rollback`]). On open, the store reconciles itself
//! with the version compiled into the running binary: a store that lags
//! behind the binary adopts the binary's version, which covers the case
//! where an install renamed the new binary into place but the commit that
//! followed never reached the disk.
//!
//! [`InstallLayout`]: crate::config::InstallLayout

use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::InstallLayout;
use crate::core::VersionStoreError;
use crate::utils::fs::{append_line, atomic_write};

/// How an update cycle (or a manual rollback) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Success,
    VerificationFailed,
    DownloadFailed,
    InstallFailed,
    RolledBack,
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "success",
            Self::VerificationFailed => "verification failed",
            Self::DownloadFailed => "download failed",
            Self::InstallFailed => "install failed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(label)
    }
}

/// One entry of the update history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Correlates the record with the cycle's log lines.
    pub cycle_id: Uuid,
    pub from_version: Version,
    /// Absent when the cycle failed before a candidate was known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_version: Option<Version>,
    pub timestamp: DateTime<Utc>,
    pub outcome: UpdateOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UpdateRecord {
    pub fn new(
        cycle_id: Uuid,
        from_version: Version,
        to_version: Option<Version>,
        outcome: UpdateOutcome,
    ) -> Self {
        Self {
            cycle_id,
            from_version,
            to_version,
            timestamp: Utc::now(),
            outcome,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Contents of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    pub current_version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<Version>,
    pub updated_at: DateTime<Utc>,
}

impl VersionState {
    fn new(current_version: Version, previous_version: Option<Version>) -> Self {
        Self {
            current_version,
            previous_version,
            updated_at: Utc::now(),
        }
    }
}

/// Persisted current version plus the append-only update history.
#[derive(Debug)]
pub struct VersionStore {
    state_path: PathBuf,
    history_path: PathBuf,
    state: VersionState,
}

impl VersionStore {
    /// Opens (or bootstraps) the store next to the configured binary.
    ///
    /// `running` is the version compiled into this process. A missing state
    /// file is created from it; an unreadable one is moved aside to
    /// `<state>.corrupt` and recreated, so a damaged file cannot keep the
    /// agent from starting.
    ///
    /// A recorded version behind `running` is raised to it. A recorded
    /// version ahead of `running` is kept and logged at error level: the
    /// process is an older copy than the installed binary (run from another
    /// path, or a binary swapped back by hand), and letting it lower the
    /// record would break the rule that only an explicit rollback moves the
    /// version backwards. `--rollback` commits the older version before it
    /// restores the binary, so it never produces this state itself.
    ///
    /// # Errors
    ///
    /// Fails only when the (re)created state cannot be written.
    pub fn open(layout: &InstallLayout, running: &Version) -> Result<Self, VersionStoreError> {
        Self::open_at(layout.state_file(), layout.history_file(), running)
    }

    /// Opens the store at explicit paths.
    pub fn open_at(
        state_path: PathBuf,
        history_path: PathBuf,
        running: &Version,
    ) -> Result<Self, VersionStoreError> {
        let loaded = match load_state(&state_path) {
            Ok(state) => state,
            Err(err @ VersionStoreError::Corrupt { .. }) => {
                error!(error = %err, "Discarding unreadable version state");
                quarantine(&state_path)?;
                None
            }
            Err(err) => return Err(err),
        };

        let (state, changed) = match loaded {
            None => {
                info!(version = %running, path = %state_path.display(), "Initializing version state");
                (VersionState::new(running.clone(), None), true)
            }
            Some(stored) if stored.current_version < *running => {
                warn!(
                    recorded = %stored.current_version,
                    running = %running,
                    "Recorded version is behind the running binary, adopting running version"
                );
                (VersionState::new(running.clone(), Some(stored.current_version)), true)
            }
            Some(stored) => {
                if stored.current_version > *running {
                    error!(
                        recorded = %stored.current_version,
                        running = %running,
                        "Running binary is older than the recorded version, keeping the record"
                    );
                }
                (stored, false)
            }
        };

        let store = Self {
            state_path,
            history_path,
            state,
        };
        if changed {
            store.persist_now(&store.state)?;
        }
        debug!(version = %store.state.current_version, "Version store opened");
        Ok(store)
    }

    pub fn current_version(&self) -> &Version {
        &self.state.current_version
    }

    pub fn previous_version(&self) -> Option<&Version> {
        self.state.previous_version.as_ref()
    }

    pub fn state(&self) -> &VersionState {
        &self.state
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Records that `version` is now installed.
    ///
    /// The in-memory state is updated even if persisting fails, because the
    /// binary on disk already is `version` by the time this is called; the
    /// error is returned so the caller can flag the audit anomaly.
    ///
    /// # Errors
    ///
    /// - [`VersionStoreError::Regression`] if `version` is not newer than the
    ///   current version; nothing is changed in that case.
    /// - [`VersionStoreError::Io`] if the state file could not be written.
    pub async fn commit_install(&mut self, version: &Version) -> Result<(), VersionStoreError> {
        if *version <= self.state.current_version {
            return Err(VersionStoreError::Regression {
                current: self.state.current_version.clone(),
                requested: version.clone(),
            });
        }

        let previous = std::mem::replace(&mut self.state.current_version, version.clone());
        self.state.previous_version = Some(previous);
        self.state.updated_at = Utc::now();
        self.persist(&self.state).await
    }

    /// Moves the current version back to the recorded previous version.
    ///
    /// Only used by an explicit operator rollback. The previous version is
    /// cleared afterwards so a second rollback cannot roll forward again.
    /// Returns the version that was current before the rollback.
    pub async fn commit_rollback(&mut self) -> Result<Version, VersionStoreError> {
        let Some(previous) = self.state.previous_version.clone() else {
            return Err(VersionStoreError::NoPreviousVersion);
        };

        let next = VersionState::new(previous, None);
        self.persist(&next).await?;
        let replaced = std::mem::replace(&mut self.state, next);
        Ok(replaced.current_version)
    }

    /// Re-reads the state file, picking up changes made by another process
    /// (an operator's `--rollback` while the agent runs).
    ///
    /// Returns whether the in-memory state changed. A missing or unreadable
    /// file leaves the in-memory state as it is; the next commit rewrites it.
    ///
    /// # Errors
    ///
    /// [`VersionStoreError::Io`] if the file exists but cannot be read. The
    /// in-memory state is unchanged in that case.
    pub async fn reload(&mut self) -> Result<bool, VersionStoreError> {
        let path = self.state_path.clone();
        let loaded = tokio::task::spawn_blocking(move || load_state(&path))
            .await
            .map_err(|e| VersionStoreError::Io {
                operation: "read",
                path: self.state_path.clone(),
                source: io::Error::other(e),
            })?;

        match loaded {
            Ok(Some(state)) if state != self.state => {
                info!(
                    current = %state.current_version,
                    was = %self.state.current_version,
                    "Version state changed on disk"
                );
                self.state = state;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err @ VersionStoreError::Corrupt { .. }) => {
                warn!(error = %err, "Ignoring unreadable version state, keeping in-memory state");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Appends a record to the history log.
    pub async fn append(&self, record: &UpdateRecord) -> Result<(), VersionStoreError> {
        let line = serde_json::to_string(record).map_err(|e| VersionStoreError::Io {
            operation: "serialize record for",
            path: self.history_path.clone(),
            source: io::Error::other(e),
        })?;
        let path = self.history_path.clone();
        blocking(move || append_line(&path, &line))
            .await
            .map_err(|source| VersionStoreError::Io {
                operation: "append to",
                path: self.history_path.clone(),
                source,
            })
    }

    /// Reads the full history, oldest first.
    ///
    /// Lines that do not parse (for example a record cut short by a crash)
    /// are skipped with a warning.
    pub fn history(&self) -> Result<Vec<UpdateRecord>, VersionStoreError> {
        let file = match fs::File::open(&self.history_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(VersionStoreError::Io {
                    operation: "read",
                    path: self.history_path.clone(),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| VersionStoreError::Io {
                operation: "read",
                path: self.history_path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UpdateRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed history record"),
            }
        }
        Ok(records)
    }

    /// The last `limit` records, oldest first.
    pub fn recent_history(&self, limit: usize) -> Result<Vec<UpdateRecord>, VersionStoreError> {
        let mut records = self.history()?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }

    async fn persist(&self, state: &VersionState) -> Result<(), VersionStoreError> {
        let json = self.serialize(state)?;
        let path = self.state_path.clone();
        blocking(move || atomic_write(&path, &json))
            .await
            .map_err(|source| self.write_error(source))
    }

    /// Synchronous [`persist`](Self::persist), for [`open_at`](Self::open_at)
    /// which runs before the agent's loops start.
    fn persist_now(&self, state: &VersionState) -> Result<(), VersionStoreError> {
        let json = self.serialize(state)?;
        atomic_write(&self.state_path, &json).map_err(|source| self.write_error(source))
    }

    fn serialize(&self, state: &VersionState) -> Result<Vec<u8>, VersionStoreError> {
        serde_json::to_vec_pretty(state).map_err(|e| VersionStoreError::Io {
            operation: "serialize state for",
            path: self.state_path.clone(),
            source: io::Error::other(e),
        })
    }

    fn write_error(&self, source: io::Error) -> VersionStoreError {
        VersionStoreError::Io {
            operation: "write",
            path: self.state_path.clone(),
            source,
        }
    }
}

/// Runs a blocking file operation off the runtime's worker threads.
async fn blocking<T, F>(op: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op).await.map_err(io::Error::other)?
}

fn load_state(path: &Path) -> Result<Option<VersionState>, VersionStoreError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(VersionStoreError::Io {
                operation: "read",
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&content).map(Some).map_err(|e| VersionStoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn quarantine(path: &Path) -> Result<(), VersionStoreError> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    fs::rename(path, &aside).map_err(|source| VersionStoreError::Io {
        operation: "move aside",
        path: path.to_path_buf(),
        source,
    })
}
