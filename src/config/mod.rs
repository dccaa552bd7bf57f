//! Agent configuration.
//!
//! Configuration is materialized once at startup and never changes while the
//! agent runs. Sources, highest priority first:
//!
//! 1. Command-line flags (each with a `HOSTPULSE_*` environment fallback)
//! 2. The TOML config file (`--config`, `HOSTPULSE_CONFIG`, or
//!    `~/.hostpulse/config.toml` when present)
//! 3. Built-in defaults
//!
//! # File format
//!
//! ```toml
//! version_server_url = "https://updates.example.com/hostpulse/"
//! install_path = "/opt/hostpulse/hostpulse"
//! update_check_interval = "1h"
//! monitor_interval = "10s"
//!
//! [upgrade]
//! max_attempts = 3
//! initial_backoff = "2s"
//!
//! [thresholds]
//! cpu = { warning = 75, critical = 90 }
//! ```
//!
//! `version_server_url` and `install_path` have no default and must come from
//! one of the sources. Durations use `humantime` syntax; `install_path` may
//! contain `~` and `$VAR` references.

mod layout;

pub use layout::InstallLayout;

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_MONITOR_INTERVAL, DEFAULT_UPDATE_CHECK_INTERVAL,
};
use crate::core::AgentError;
use crate::monitor::health::Thresholds;
use crate::upgrade::config::UpgradeConfig;
use crate::utils::backoff::RetryPolicy;
use crate::utils::fs::expand_path;

/// Contents of the config file. Every field is optional here; required
/// settings are enforced when resolving into an [`AgentConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_server_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub update_check_interval: Option<Duration>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub monitor_interval: Option<Duration>,

    #[serde(default)]
    pub upgrade: UpgradeConfig,

    #[serde(default)]
    pub thresholds: Thresholds,
}

impl ConfigFile {
    /// Default location: `~/.hostpulse/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from an explicit path; the file must exist.
    pub async fn load_from(path: &Path) -> Result<Self, AgentError> {
        let content =
            tokio::fs::read_to_string(path).await.map_err(|e| AgentError::ConfigFileError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        toml::from_str(&content).map_err(|e| AgentError::ConfigFileError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load from `path` if given, else from the default location if a file
    /// exists there, else return an empty config.
    pub async fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        if let Some(path) = path {
            return Self::load_from(path).await;
        }

        match Self::default_path() {
            Some(path) if path.is_file() => {
                debug!(path = %path.display(), "Loading default config file");
                Self::load_from(&path).await
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Values supplied on the command line (or their environment fallbacks).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub version_server_url: Option<String>,
    pub install_path: Option<PathBuf>,
    pub update_check_interval: Option<Duration>,
    pub monitor_interval: Option<Duration>,
    pub disable_updates: bool,
}

/// Immutable, validated configuration snapshot owned by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Base URL of the version server; always ends with `/`.
    pub version_server_url: Url,
    /// Absolute path of the binary the agent replaces on update.
    pub install_path: PathBuf,
    pub update_check_interval: Duration,
    pub monitor_interval: Duration,
    pub upgrade: UpgradeConfig,
    pub thresholds: Thresholds,
}

impl AgentConfig {
    /// Merge file and overrides, apply defaults, validate.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> Result<Self, AgentError> {
        let raw_url = overrides
            .version_server_url
            .or(file.version_server_url)
            .ok_or_else(|| config_error("version_server_url is required"))?;
        let version_server_url = parse_server_url(&raw_url)?;

        let install_path = match overrides.install_path {
            Some(path) => path,
            None => {
                let raw = file
                    .install_path
                    .ok_or_else(|| config_error("install_path is required"))?;
                expand_path(&raw).map_err(config_error)?
            }
        };
        let install_path = absolutize(install_path)?;

        let update_check_interval = overrides
            .update_check_interval
            .or(file.update_check_interval)
            .unwrap_or(DEFAULT_UPDATE_CHECK_INTERVAL);
        let monitor_interval = overrides
            .monitor_interval
            .or(file.monitor_interval)
            .unwrap_or(DEFAULT_MONITOR_INTERVAL);

        let mut upgrade = file.upgrade;
        if overrides.disable_updates {
            upgrade.enabled = false;
        }

        let config = Self {
            version_server_url,
            install_path,
            update_check_interval,
            monitor_interval,
            upgrade,
            thresholds: file.thresholds,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the file (if any) and resolve it against `overrides`.
    pub async fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, AgentError> {
        let file = ConfigFile::load(config_path).await?;
        Self::resolve(file, overrides)
    }

    fn validate(&self) -> Result<(), AgentError> {
        if self.update_check_interval.is_zero() {
            return Err(config_error("update_check_interval must be greater than zero"));
        }
        if self.monitor_interval.is_zero() {
            return Err(config_error("monitor_interval must be greater than zero"));
        }
        if self.upgrade.max_attempts == 0 {
            return Err(config_error("upgrade.max_attempts must be at least 1"));
        }
        if self.upgrade.request_timeout.is_zero() || self.upgrade.download_timeout.is_zero() {
            return Err(config_error("upgrade timeouts must be greater than zero"));
        }
        if self.install_path.file_name().is_none() {
            return Err(config_error(format!(
                "install_path {} does not name a file",
                self.install_path.display()
            )));
        }
        if let Some(resource) = self.thresholds.invalid_resource() {
            return Err(config_error(format!(
                "thresholds.{resource} must satisfy 0 <= warning <= critical <= 100"
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(&self.install_path)
    }

    /// Backoff for update stages; a single delay never exceeds the check interval.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.upgrade.max_attempts,
            self.upgrade.initial_backoff,
            self.upgrade.max_backoff.min(self.update_check_interval),
        )
    }
}

fn config_error(message: impl Into<String>) -> AgentError {
    AgentError::ConfigError {
        message: message.into(),
    }
}

fn parse_server_url(raw: &str) -> Result<Url, AgentError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| config_error(format!("version_server_url '{raw}' is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(config_error(format!(
            "version_server_url must use http or https, got '{}'",
            url.scheme()
        )));
    }
    // Url::join replaces the last segment unless the base ends with a slash.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn absolutize(path: PathBuf) -> Result<PathBuf, AgentError> {
    if path.is_absolute() {
        return Ok(path);
    }
    std::path::absolute(&path).map_err(|e| {
        config_error(format!("cannot resolve install_path {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrade::config::RestartMode;
    use tempfile::TempDir;

    fn minimal_overrides() -> ConfigOverrides {
        ConfigOverrides {
            version_server_url: Some("https://updates.example.com/hostpulse".to_string()),
            install_path: Some(PathBuf::from("/opt/hostpulse/hostpulse")),
            ..ConfigOverrides::default()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let config = AgentConfig::resolve(ConfigFile::default(), minimal_overrides()).unwrap();

        assert_eq!(config.update_check_interval, Duration::from_secs(3600));
        assert_eq!(config.monitor_interval, Duration::from_secs(10));
        assert!(config.upgrade.enabled);
        assert_eq!(config.version_server_url.as_str(), "https://updates.example.com/hostpulse/");
    }

    #[test]
    fn test_missing_required_fields() {
        let err = AgentConfig::resolve(ConfigFile::default(), ConfigOverrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("version_server_url"));

        let overrides = ConfigOverrides {
            version_server_url: Some("http://localhost:8080".to_string()),
            ..ConfigOverrides::default()
        };
        let err = AgentConfig::resolve(ConfigFile::default(), overrides).unwrap_err();
        assert!(err.to_string().contains("install_path"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let overrides = ConfigOverrides {
            monitor_interval: Some(Duration::ZERO),
            ..minimal_overrides()
        };
        let err = AgentConfig::resolve(ConfigFile::default(), overrides).unwrap_err();
        assert!(err.to_string().contains("monitor_interval"));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let overrides = ConfigOverrides {
            version_server_url: Some("not a url".to_string()),
            ..minimal_overrides()
        };
        assert!(AgentConfig::resolve(ConfigFile::default(), overrides).is_err());

        let overrides = ConfigOverrides {
            version_server_url: Some("ftp://updates.example.com/".to_string()),
            ..minimal_overrides()
        };
        let err = AgentConfig::resolve(ConfigFile::default(), overrides).unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn test_overrides_beat_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            version_server_url = "https://file.example.com/"
            install_path = "/srv/agent/hostpulse"
            update_check_interval = "30m"
            monitor_interval = "5s"
            "#,
        )
        .unwrap();
        let overrides = ConfigOverrides {
            monitor_interval: Some(Duration::from_secs(1)),
            disable_updates: true,
            ..ConfigOverrides::default()
        };

        let config = AgentConfig::resolve(file, overrides).unwrap();
        assert_eq!(config.version_server_url.as_str(), "https://file.example.com/");
        assert_eq!(config.install_path, PathBuf::from("/srv/agent/hostpulse"));
        assert_eq!(config.update_check_interval, Duration::from_secs(1800));
        assert_eq!(config.monitor_interval, Duration::from_secs(1));
        assert!(!config.upgrade.enabled);
    }

    #[test]
    fn test_retry_policy_capped_by_check_interval() {
        let overrides = ConfigOverrides {
            update_check_interval: Some(Duration::from_secs(60)),
            ..minimal_overrides()
        };
        let config = AgentConfig::resolve(ConfigFile::default(), overrides).unwrap();
        let policy = config.retry_policy();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_relative_install_path_made_absolute() {
        let overrides = ConfigOverrides {
            install_path: Some(PathBuf::from("bin/hostpulse")),
            ..minimal_overrides()
        };
        let config = AgentConfig::resolve(ConfigFile::default(), overrides).unwrap();
        assert!(config.install_path.is_absolute());
        assert!(config.install_path.ends_with("bin/hostpulse"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            version_server_url = "http://127.0.0.1:9000/"
            install_path = "/opt/hostpulse/hostpulse"

            [upgrade]
            restart = "exit"
            max_attempts = 5

            [thresholds]
            disk = { warning = 70, critical = 80 }
            "#,
        )
        .unwrap();

        let config = AgentConfig::load(Some(&path), ConfigOverrides::default()).await.unwrap();
        assert_eq!(config.upgrade.restart, RestartMode::Exit);
        assert_eq!(config.upgrade.max_attempts, 5);
        assert_eq!(config.thresholds.disk.warning, 70.0);
    }

    #[tokio::test]
    async fn test_load_from_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "monitor_interval = \"soon\"").unwrap();

        let err = ConfigFile::load_from(&path).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfigFileError { .. }));

        let err = ConfigFile::load_from(&temp.path().join("missing.toml")).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfigFileError { .. }));
    }
}
