//! Where the agent keeps its files relative to the installed binary.
//!
//! All state lives in the install directory so it shares the binary's file
//! system; renames between staging and the install path are then atomic.
//!
//! For an install path of `/opt/hostpulse/hostpulse`:
//!
//! ```text
//! /opt/hostpulse/
//! ├── hostpulse                     # the live binary
//! ├── hostpulse.backup              # previous binary (upgrade.keep_backup)
//! ├── .hostpulse.state.json         # current / previous version
//! ├── .hostpulse.history.jsonl      # update history
//! ├── .hostpulse.lock               # install lock
//! └── .hostpulse.staging/           # in-progress downloads
//! ```

use std::path::{Path, PathBuf};

use crate::utils::fs::parent_dir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    install_path: PathBuf,
    dir: PathBuf,
    bin_name: String,
}

impl InstallLayout {
    pub fn new(install_path: impl Into<PathBuf>) -> Self {
        let install_path = install_path.into();
        let dir = parent_dir(&install_path).to_path_buf();
        let bin_name = install_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hostpulse".to_string());

        Self {
            install_path,
            dir,
            bin_name,
        }
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    /// Directory containing the binary and all agent state.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bin_name(&self) -> &str {
        &self.bin_name
    }

    pub fn state_file(&self) -> PathBuf {
        self.hidden(".state.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.hidden(".history.jsonl")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.hidden(".lock")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.hidden(".staging")
    }

    pub fn backup_file(&self) -> PathBuf {
        self.dir.join(format!("{}.backup", self.bin_name))
    }

    fn hidden(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!(".{}{suffix}", self.bin_name))
    }
}
