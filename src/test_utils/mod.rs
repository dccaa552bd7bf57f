//! Test utilities for hostpulse
//!
//! Fakes for the agent's external collaborators, so update cycles and the
//! monitor loop can be driven without a network or real host metrics:
//!
//! - [`FakeReleaseSource`] - an in-process version server with scripted
//!   failures and latency
//! - [`FakeSampler`] - fixed metric readings, optionally failing
//!
//! Enabled for unit tests and, through the `test-utils` feature, for the
//! integration test target.
//!
//! # Example
//!
//! ```rust,no_run
//! use hostpulse::config::InstallLayout;
//! use hostpulse::test_utils::FakeReleaseSource;
//! use hostpulse::upgrade::Staging;
//!
//! let layout = InstallLayout::new("/tmp/agent/hostpulse");
//! let source = FakeReleaseSource::new(Staging::new(&layout), "2.0.0").failing_latest(2);
//! ```

use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use reqwest::Url;
use semver::Version;
use sha2::{Digest, Sha256};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::core::{FetchError, SampleError};
use crate::monitor::{Capacity, Sampler};
use crate::upgrade::fetcher::{Release, ReleaseSource, StagedArtifact, Staging};

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Only the first call has an effect. Uses `level` if given, otherwise
/// `RUST_LOG`; with neither, tests run silently.
///
/// ```bash
/// RUST_LOG=hostpulse=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}

/// A tiny shell script that passes the executable header check everywhere
/// except Windows.
pub fn fake_binary(version: &str) -> Vec<u8> {
    format!("#!/bin/sh\necho hostpulse {version}\n").into_bytes()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A release announcing exactly `payload`.
pub fn release_for(version: &str, payload: &[u8]) -> Release {
    let version = Version::parse(version).unwrap_or_else(|e| panic!("bad test version {version}: {e}"));
    let url = Url::parse(&format!("http://127.0.0.1/artifacts/hostpulse-{version}"))
        .unwrap_or_else(|e| panic!("bad test url: {e}"));
    Release {
        version,
        url,
        checksum: sha256_hex(payload),
        size: payload.len() as u64,
    }
}

/// Scripted [`ReleaseSource`].
///
/// Announces one release and serves its payload through the real
/// [`Staging`] directory, so staged files behave exactly as in production.
pub struct FakeReleaseSource {
    staging: Staging,
    release: Release,
    payload: Vec<u8>,
    latest_failures: AtomicU32,
    download_failures: AtomicU32,
    latest_protocol_error: bool,
    download_latency: Duration,
    latest_calls: AtomicU32,
    download_calls: AtomicU32,
}

impl FakeReleaseSource {
    /// Announces `version` with a matching checksum for [`fake_binary`].
    pub fn new(staging: Staging, version: &str) -> Self {
        let payload = fake_binary(version);
        Self {
            staging,
            release: release_for(version, &payload),
            payload,
            latest_failures: AtomicU32::new(0),
            download_failures: AtomicU32::new(0),
            latest_protocol_error: false,
            download_latency: Duration::ZERO,
            latest_calls: AtomicU32::new(0),
            download_calls: AtomicU32::new(0),
        }
    }

    /// Announce `checksum` instead of the payload's real digest.
    #[must_use]
    pub fn with_checksum(mut self, checksum: &str) -> Self {
        self.release.checksum = checksum.to_string();
        self
    }

    /// Serve `payload`, keeping the announced checksum and size.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// The first `n` latest-release queries time out.
    #[must_use]
    pub fn failing_latest(self, n: u32) -> Self {
        self.latest_failures.store(n, Ordering::SeqCst);
        self
    }

    /// The first `n` downloads end early.
    #[must_use]
    pub fn failing_downloads(self, n: u32) -> Self {
        self.download_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every latest-release query gets a malformed answer.
    #[must_use]
    pub fn with_protocol_error(mut self) -> Self {
        self.latest_protocol_error = true;
        self
    }

    #[must_use]
    pub fn with_download_latency(mut self, latency: Duration) -> Self {
        self.download_latency = latency;
        self
    }

    pub fn release(&self) -> &Release {
        &self.release
    }

    pub fn latest_calls(&self) -> u32 {
        self.latest_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> u32 {
        self.download_calls.load(Ordering::SeqCst)
    }
}

/// Decrements `counter` if positive; true when a failure should be injected.
fn take_failure(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl ReleaseSource for FakeReleaseSource {
    async fn latest_release(&self) -> Result<Release, FetchError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        if self.latest_protocol_error {
            return Err(FetchError::ProtocolError {
                reason: "invalid JSON: expected value at line 1 column 1".to_string(),
            });
        }
        if take_failure(&self.latest_failures) {
            return Err(FetchError::NetworkError {
                operation: "checking latest version",
                message: "timed out".to_string(),
            });
        }
        Ok(self.release.clone())
    }

    async fn download(&self, release: &Release) -> Result<StagedArtifact, FetchError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if !self.download_latency.is_zero() {
            tokio::time::sleep(self.download_latency).await;
        }
        if take_failure(&self.download_failures) {
            let received = release.size / 2;
            return Err(FetchError::TruncatedTransfer {
                expected: release.size,
                received,
            });
        }

        let mut staged = self.staging.stage_bytes(release, &self.payload).await?;
        // the declared size comes from the release, not from what was served
        staged.size = release.size;
        Ok(staged)
    }
}

/// Fixed readings; individual metrics can be made to fail.
#[derive(Debug, Clone)]
pub struct FakeSampler {
    cpu: f32,
    memory: Capacity,
    disk: Capacity,
    fail_memory: bool,
}

impl FakeSampler {
    pub fn new(cpu: f32, memory: Capacity, disk: Capacity) -> Self {
        Self {
            cpu,
            memory,
            disk,
            fail_memory: false,
        }
    }

    #[must_use]
    pub fn with_failing_memory(mut self) -> Self {
        self.fail_memory = true;
        self
    }
}

impl Sampler for FakeSampler {
    fn cpu_percent(&mut self) -> Result<f32, SampleError> {
        Ok(self.cpu)
    }

    fn memory(&mut self) -> Result<Capacity, SampleError> {
        if self.fail_memory {
            Err(SampleError::new("memory", "meminfo unreadable"))
        } else {
            Ok(self.memory)
        }
    }

    fn disk(&mut self) -> Result<Capacity, SampleError> {
        Ok(self.disk)
    }
}
