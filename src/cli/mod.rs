//! Command-line interface for hostpulse.
//!
//! `hostpulse` normally runs in the foreground as a long-lived agent: it
//! samples host metrics on one timer and checks for new versions of itself
//! on another, until it receives Ctrl-C / SIGTERM or restarts into an update.
//!
//! # One-shot modes
//!
//! - `--check` - ask the version server once whether an update exists
//! - `--status` - print the recorded versions and recent update history
//! - `--rollback` - put the previous binary (`<bin>.backup`) back in place
//!
//! # Configuration precedence
//!
//! Command-line flags win over their `HOSTPULSE_*` environment variables,
//! which win over the config file (`--config`, `HOSTPULSE_CONFIG`, or
//! `~/.hostpulse/config.toml`).
//!
//! # Examples
//!
//! ```bash
//! hostpulse --server-url https://updates.example.com/hostpulse/ \
//!           --install-path /opt/hostpulse/bin/hostpulse
//! hostpulse --config /etc/hostpulse.toml --monitor-interval 30s
//! hostpulse --config /etc/hostpulse.toml --status
//! ```

pub mod upgrade;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentExit, HostAgent, shutdown_signal};
use crate::config::{AgentConfig, ConfigOverrides};

/// Self-updating host monitoring agent.
#[derive(Parser, Debug)]
#[command(
    name = "hostpulse",
    about = "Self-updating host agent that samples CPU, memory and disk utilization",
    version,
    long_about = "hostpulse samples local resource utilization and keeps itself up to date \
                  from a version server, replacing its own binary atomically."
)]
#[command(group(ArgGroup::new("mode").args(["check", "status", "rollback"])))]
pub struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `~/.hostpulse/config.toml` when that file exists.
    #[arg(short, long, env = "HOSTPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL of the version server (`GET <url>/latest`).
    #[arg(long, env = "HOSTPULSE_SERVER_URL")]
    server_url: Option<String>,

    /// Path of the binary to keep up to date.
    #[arg(long, env = "HOSTPULSE_INSTALL_PATH")]
    install_path: Option<PathBuf>,

    /// Time between update checks, e.g. `30m` or `1h`.
    #[arg(long, env = "HOSTPULSE_UPDATE_INTERVAL", value_parser = humantime::parse_duration)]
    update_interval: Option<Duration>,

    /// Time between metric samples, e.g. `10s`.
    #[arg(long, env = "HOSTPULSE_MONITOR_INTERVAL", value_parser = humantime::parse_duration)]
    monitor_interval: Option<Duration>,

    /// Monitor only; never check for or install updates.
    #[arg(long)]
    no_auto_update: bool,

    /// Enable debug logging. `RUST_LOG` takes precedence when set.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,

    /// Check once whether a newer version is available, then exit.
    #[arg(long)]
    check: bool,

    /// Show installed versions and recent update history, then exit.
    #[arg(long)]
    status: bool,

    /// Restore the previous binary from its backup, then exit.
    #[arg(long)]
    rollback: bool,
}

impl Cli {
    /// Default log filter for the chosen verbosity.
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// Flag values that override the config file.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            version_server_url: self.server_url.clone(),
            install_path: self.install_path.clone(),
            update_check_interval: self.update_interval,
            monitor_interval: self.monitor_interval,
            disable_updates: self.no_auto_update,
        }
    }

    /// Load the configuration and run the selected mode.
    ///
    /// Returns only on clean shutdown or on a fatal error. After an update is
    /// installed the process is replaced by the new binary (or exits for its
    /// supervisor) and this function does not return.
    pub async fn execute(self) -> Result<()> {
        let config = AgentConfig::load(self.config.as_deref(), self.overrides()).await?;

        if self.status {
            return upgrade::show_status(&config).await;
        }
        if self.check {
            return upgrade::check_for_updates(&config).await;
        }
        if self.rollback {
            return upgrade::rollback(&config).await;
        }

        run_agent(&config).await
    }
}

async fn run_agent(config: &AgentConfig) -> Result<()> {
    let agent = HostAgent::bootstrap(config).await?;

    match agent.run(shutdown_signal()).await {
        AgentExit::Shutdown => {
            info!("hostpulse stopped");
            Ok(())
        }
        AgentExit::Restart { version, installer } => {
            info!(version = %version, "Restarting into new version");
            match installer.restart() {
                Ok(never) => match never {},
                Err(e) => Err(e).context("Update installed but restart failed"),
            }
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. Logs go to
/// stderr so the one-shot modes keep stdout for their output.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
