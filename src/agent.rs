//! Process-lifetime wiring of the monitor loop and the update controller.
//!
//! The two run side by side on the same runtime and share nothing but the
//! shutdown channel. Sampling never waits on an update: the monitor runs in
//! its own task while the controller's cycle (network, hashing, renames)
//! proceeds in the agent's task.

use std::future::Future;
use std::time::Duration;

use semver::Version;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::constants::embedded_version;
use crate::core::AgentError;
use crate::monitor::{LogSink, MonitorLoop, SampleSink, Sampler, SysinfoSampler};
use crate::upgrade::{
    ArtifactVerifier, ControllerExit, Installer, ReleaseSource, Staging, UpdateController,
    UpdateFetcher,
};
use crate::utils::fs::check_writable;
use crate::utils::shutdown::{self, ShutdownTrigger};
use crate::version_store::VersionStore;

/// How [`Agent::run`] ended.
#[derive(Debug)]
pub enum AgentExit {
    /// Shutdown was requested and both loops have stopped.
    Shutdown,
    /// `version` is installed; call [`Installer::restart`] to hand over.
    Restart { version: Version, installer: Installer },
}

/// The agent assembled from production components.
pub type HostAgent = Agent<UpdateFetcher, SysinfoSampler, LogSink>;

pub struct Agent<S, M, K> {
    trigger: ShutdownTrigger,
    monitor: MonitorLoop<M, K>,
    /// `None` when automatic updates are disabled.
    controller: Option<UpdateController<S>>,
    update_interval: Duration,
}

impl HostAgent {
    /// Build the agent for `config`.
    ///
    /// Checks that the install directory is writable, opens (or bootstraps)
    /// the version store, and removes downloads orphaned by an earlier crash.
    ///
    /// # Errors
    ///
    /// Any [`AgentError`] here is fatal: the agent cannot safely run.
    pub async fn bootstrap(config: &AgentConfig) -> Result<Self, AgentError> {
        let layout = config.layout();

        check_writable(layout.dir()).map_err(|e| AgentError::InstallPathNotWritable {
            path: config.install_path.clone(),
            reason: e.to_string(),
        })?;

        let store = VersionStore::open(&layout, &embedded_version())?;
        info!(
            version = %store.current_version(),
            install_path = %config.install_path.display(),
            "hostpulse starting"
        );

        let staging = Staging::new(&layout);
        match staging.sweep().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Cleaned up interrupted downloads"),
            Err(e) => warn!(error = %e, "Could not clean staging directory"),
        }

        let (trigger, listener) = shutdown::channel();

        let controller = if config.upgrade.enabled {
            let fetcher = UpdateFetcher::new(config.version_server_url.clone(), staging, &config.upgrade)
                .map_err(|e| AgentError::ConfigError {
                    message: e.to_string(),
                })?;
            let controller = UpdateController::new(
                fetcher,
                ArtifactVerifier::new(config.upgrade.verify_executable),
                Installer::new(layout, &config.upgrade),
                store,
                config.retry_policy(),
                listener.clone(),
            )
            .check_on_startup(config.upgrade.check_on_startup);
            Some(controller)
        } else {
            info!("Automatic updates disabled");
            None
        };

        let agent_id = SysinfoSampler::host_name().unwrap_or_else(|| "unknown".to_string());
        let monitor = MonitorLoop::new(
            SysinfoSampler::new(),
            LogSink::new(agent_id),
            config.monitor_interval,
            config.thresholds,
            listener,
        );

        Ok(Agent::new(trigger, monitor, controller, config.update_check_interval))
    }
}

impl<S, M, K> Agent<S, M, K>
where
    S: ReleaseSource,
    M: Sampler + 'static,
    K: SampleSink + 'static,
{
    /// `monitor` and `controller` must listen on `trigger`'s channel.
    pub fn new(
        trigger: ShutdownTrigger,
        monitor: MonitorLoop<M, K>,
        controller: Option<UpdateController<S>>,
        update_interval: Duration,
    ) -> Self {
        Self {
            trigger,
            monitor,
            controller,
            update_interval,
        }
    }

    /// Run until `signal` resolves or an update is installed.
    ///
    /// When `signal` fires, an update cycle in progress is allowed to finish
    /// (its retry waits are cut short) before the agent returns.
    pub async fn run(self, signal: impl Future<Output = ()>) -> AgentExit {
        let Self {
            trigger,
            monitor,
            controller,
            update_interval,
        } = self;

        let monitor_task = tokio::spawn(monitor.run());

        let exit = {
            let mut stopped = trigger.listener();
            let updates = async {
                match &controller {
                    Some(controller) => controller.run(update_interval).await,
                    None => {
                        stopped.triggered().await;
                        ControllerExit::Shutdown
                    }
                }
            };
            tokio::pin!(updates);
            tokio::pin!(signal);

            tokio::select! {
                exit = &mut updates => exit,
                () = &mut signal => {
                    info!("Shutdown requested");
                    trigger.trigger();
                    updates.await
                }
            }
        };

        trigger.trigger();
        match monitor_task.await {
            Ok(samples) => info!(samples, "Monitoring stopped"),
            Err(e) => warn!(error = %e, "Monitor task ended abnormally"),
        }

        match (exit, controller) {
            (ControllerExit::Restart(version), Some(controller)) => AgentExit::Restart {
                version,
                installer: controller.into_installer(),
            },
            _ => AgentExit::Shutdown,
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
