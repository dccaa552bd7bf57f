//! The update state machine.
//!
//! ```text
//! Idle ─► Checking ─► Downloading ─► Verifying ─► Installing ─► Restarting
//!  ▲          │             │             │             │
//!  └──────────┴─────────────┴─────────────┴─────────────┘  (failure)
//! ```
//!
//! [`UpdateController::run_cycle`] walks these states once. Every failure
//! ends the cycle, appends an [`UpdateRecord`] to the history, drops the
//! staged artifact (which deletes it) and returns the controller to `Idle`.
//! `Restarting` is terminal: once an install is committed the caller is
//! expected to hand over to the new binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use semver::Version;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::core::FetchError;
use crate::upgrade::fetcher::{Release, ReleaseSource};
use crate::upgrade::installer::Installer;
use crate::upgrade::verification::ArtifactVerifier;
use crate::utils::backoff::{RetryPolicy, retry_transient};
use crate::utils::shutdown::ShutdownListener;
use crate::version_store::{UpdateOutcome, UpdateRecord, VersionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Installing,
    Restarting,
}

/// Result of one [`UpdateController::run_cycle`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleResult {
    /// Another cycle was in flight; this one did nothing.
    Busy,
    UpToDate,
    Failed(UpdateOutcome),
    Installed { from: Version, to: Version },
}

/// Why [`UpdateController::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerExit {
    Shutdown,
    /// A new version is installed and committed; restart into it.
    Restart(Version),
}

/// Clears the in-flight flag however the cycle ends, including cancellation.
struct CycleGuard<'a> {
    in_flight: &'a AtomicBool,
    state: &'a watch::Sender<UpdateState>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if matches!(state, UpdateState::Idle | UpdateState::Restarting) {
                false
            } else {
                *state = UpdateState::Idle;
                true
            }
        });
        self.in_flight.store(false, Ordering::Release);
    }
}

pub struct UpdateController<S> {
    source: S,
    verifier: ArtifactVerifier,
    installer: Installer,
    store: Mutex<VersionStore>,
    policy: RetryPolicy,
    check_on_startup: bool,
    state: watch::Sender<UpdateState>,
    in_flight: AtomicBool,
    shutdown: ShutdownListener,
}

impl<S: ReleaseSource> UpdateController<S> {
    pub fn new(
        source: S,
        verifier: ArtifactVerifier,
        installer: Installer,
        store: VersionStore,
        policy: RetryPolicy,
        shutdown: ShutdownListener,
    ) -> Self {
        let (state, _) = watch::channel(UpdateState::Idle);
        Self {
            source,
            verifier,
            installer,
            store: Mutex::new(store),
            policy,
            check_on_startup: true,
            state,
            in_flight: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Whether [`run`](Self::run) checks immediately or waits one interval.
    #[must_use]
    pub fn check_on_startup(mut self, enabled: bool) -> Self {
        self.check_on_startup = enabled;
        self
    }

    pub fn state(&self) -> UpdateState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state.subscribe()
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    /// Give up the controller, keeping the installer for the restart.
    pub fn into_installer(self) -> Installer {
        self.installer
    }

    pub async fn current_version(&self) -> Version {
        self.store.lock().await.current_version().clone()
    }

    /// Exclusive access to the version store. Waits for a running install.
    pub async fn store(&self) -> MutexGuard<'_, VersionStore> {
        self.store.lock().await
    }

    /// Ask the server once for the latest release.
    ///
    /// Returns the release only when it is strictly newer than the current
    /// version. Does not retry and records nothing.
    pub async fn check_for_update(&self) -> Result<Option<Release>, FetchError> {
        let release = self.source.latest_release().await?;
        let current = self.current_version().await;
        Ok((release.version > current).then_some(release))
    }

    /// Drive one update attempt from `Idle` to `Restarting` or back to `Idle`.
    pub async fn run_cycle(&self) -> CycleResult {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Update cycle already in flight, skipping");
            return CycleResult::Busy;
        }
        let _guard = CycleGuard {
            in_flight: &self.in_flight,
            state: &self.state,
        };
        if self.state() == UpdateState::Restarting {
            debug!("Restart pending, not starting another cycle");
            return CycleResult::Busy;
        }

        let cycle_id = Uuid::new_v4();
        self.cycle(cycle_id)
            .instrument(info_span!("update_cycle", %cycle_id))
            .await
    }

    async fn cycle(&self, cycle_id: Uuid) -> CycleResult {
        let from = {
            let mut store = self.store.lock().await;
            if let Err(e) = store.reload().await {
                warn!(error = %e, "Could not re-read version state, using the last known state");
            }
            store.current_version().clone()
        };

        self.enter(UpdateState::Checking);
        let source = &self.source;
        let latest = retry_transient(&self.policy, &self.shutdown, "check for update", move || {
            source.latest_release()
        })
        .await;
        let release = match latest {
            Ok(release) => release,
            Err(e) => {
                let record = UpdateRecord::new(cycle_id, from, None, UpdateOutcome::DownloadFailed)
                    .with_detail(format!("checking: {e}"));
                return self.fail(record).await;
            }
        };

        if release.version <= from {
            debug!(current = %from, latest = %release.version, "Already up to date");
            return CycleResult::UpToDate;
        }
        let to = release.version.clone();
        info!(current = %from, candidate = %to, "Newer version available");

        self.enter(UpdateState::Downloading);
        let release = &release;
        let downloaded = retry_transient(&self.policy, &self.shutdown, "download update", move || {
            source.download(release)
        })
        .await;
        let staged = match downloaded {
            Ok(staged) => staged,
            Err(e) => {
                let record = UpdateRecord::new(cycle_id, from, Some(to), UpdateOutcome::DownloadFailed)
                    .with_detail(e.to_string());
                return self.fail(record).await;
            }
        };

        self.enter(UpdateState::Verifying);
        let verified = match self.verifier.verify(staged).await {
            Ok(verified) => verified,
            Err(e) => {
                let record =
                    UpdateRecord::new(cycle_id, from, Some(to), UpdateOutcome::VerificationFailed)
                        .with_detail(e.to_string());
                return self.fail(record).await;
            }
        };

        self.enter(UpdateState::Installing);
        let mut store = self.store.lock().await;
        let receipt = match self.installer.install(verified, &mut store).await {
            Ok(receipt) => receipt,
            Err(e) => {
                drop(store);
                let record = UpdateRecord::new(cycle_id, from, Some(to), UpdateOutcome::InstallFailed)
                    .with_detail(e.to_string());
                return self.fail(record).await;
            }
        };

        let mut record = UpdateRecord::new(
            cycle_id,
            receipt.from.clone(),
            Some(receipt.to.clone()),
            UpdateOutcome::Success,
        );
        if let Some(anomaly) = &receipt.store_anomaly {
            record = record.with_detail(format!("version commit failed: {anomaly}"));
        }
        append_record(&store, &record).await;
        drop(store);

        self.enter(UpdateState::Restarting);
        info!(from = %receipt.from, to = %receipt.to, "Update installed");
        CycleResult::Installed {
            from: receipt.from,
            to: receipt.to,
        }
    }

    /// Tick every `interval` until shutdown or a successful install.
    ///
    /// Ticks that fall due while a cycle runs are skipped, not queued. A
    /// shutdown lets the running cycle finish (retry waits are cut short)
    /// and then stops.
    pub async fn run(&self, interval: Duration) -> ControllerExit {
        let start = if self.check_on_startup {
            Instant::now()
        } else {
            Instant::now() + interval
        };
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.clone();

        info!(interval = ?interval, "Update checks scheduled");
        loop {
            tokio::select! {
                biased;
                () = shutdown.triggered() => {
                    info!("Update controller stopping");
                    return ControllerExit::Shutdown;
                }
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                CycleResult::Installed { to, .. } => return ControllerExit::Restart(to),
                CycleResult::Failed(outcome) => {
                    warn!(outcome = %outcome, "Update cycle failed, will retry next interval");
                }
                CycleResult::UpToDate | CycleResult::Busy => {}
            }
        }
    }

    fn enter(&self, next: UpdateState) {
        debug!(state = ?next, "Update state");
        self.state.send_replace(next);
    }

    async fn fail(&self, record: UpdateRecord) -> CycleResult {
        warn!(
            outcome = %record.outcome,
            detail = record.detail.as_deref().unwrap_or(""),
            "Update cycle aborted"
        );
        append_record(&*self.store.lock().await, &record).await;
        self.enter(UpdateState::Idle);
        CycleResult::Failed(record.outcome)
    }
}

async fn append_record(store: &VersionStore, record: &UpdateRecord) {
    if let Err(e) = store.append(record).await {
        error!(error = %e, outcome = %record.outcome, "Failed to append update record");
    }
}
