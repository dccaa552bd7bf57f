//! Version server client and download staging.
//!
//! The version server speaks a two-request protocol:
//!
//! ```text
//! GET {server}/latest   -> {"version": "2.0.0", "url": "...", "checksum": "<sha256 hex>", "size": 1234}
//! GET {url}             -> raw artifact bytes, Content-Length = size
//! ```
//!
//! `url` may be absolute or relative to the server URL. HTTP 5xx and 429
//! responses count as network errors (and are retried by the controller); any other
//! non-success status or malformed body is a protocol error.
//!
//! Downloads stream into the staging directory next to the binary and are
//! never written to the install path. A [`StagedArtifact`] owns its file and
//! deletes it when dropped, so an artifact that fails verification or
//! installation leaves nothing behind. Files orphaned by a crash are removed
//! by [`Staging::sweep`] at startup.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Response, StatusCode, Url};
use semver::Version;
use serde::Deserialize;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::InstallLayout;
use crate::core::FetchError;
use crate::upgrade::config::UpgradeConfig;

const CHECK_OPERATION: &str = "checking latest version";
const DOWNLOAD_OPERATION: &str = "downloading artifact";

/// A candidate release announced by the version server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub url: Url,
    /// SHA-256 of the artifact, as announced (hex, optionally `sha256:`-prefixed).
    pub checksum: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    version: String,
    url: String,
    checksum: String,
    size: u64,
}

impl LatestResponse {
    fn into_release(self, base: &Url) -> Result<Release, FetchError> {
        let version = parse_version(&self.version)?;
        let url = base.join(&self.url).map_err(|e| FetchError::ProtocolError {
            reason: format!("artifact url '{}' is invalid: {e}", self.url),
        })?;
        if self.checksum.trim().is_empty() {
            return Err(FetchError::ProtocolError {
                reason: "artifact checksum is empty".to_string(),
            });
        }
        if self.size == 0 {
            return Err(FetchError::ProtocolError {
                reason: "artifact size is zero".to_string(),
            });
        }

        Ok(Release {
            version,
            url,
            checksum: self.checksum,
            size: self.size,
        })
    }
}

/// Parse a server-reported version, tolerating a leading `v`.
pub fn parse_version(raw: &str) -> Result<Version, FetchError> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed).map_err(|e| FetchError::ProtocolError {
        reason: format!("version '{raw}' is not valid semver: {e}"),
    })
}

/// Where update candidates come from.
///
/// [`UpdateFetcher`] is the HTTP implementation; tests substitute their own.
pub trait ReleaseSource: Send + Sync {
    /// Query the newest available release.
    fn latest_release(&self) -> impl Future<Output = Result<Release, FetchError>> + Send;

    /// Download `release` into staging.
    fn download(
        &self,
        release: &Release,
    ) -> impl Future<Output = Result<StagedArtifact, FetchError>> + Send;
}

/// A fully written download waiting for verification.
///
/// The staged file is deleted when this value (or the verified artifact
/// wrapping it) is dropped without being installed.
#[derive(Debug)]
pub struct StagedArtifact {
    path: TempPath,
    pub declared_version: Version,
    pub size: u64,
    pub checksum: String,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands the file over to the installer, which moves it into place.
    pub(crate) fn into_temp_path(self) -> TempPath {
        self.path
    }
}

/// The staging directory for downloads, `.<bin>.staging/` next to the binary.
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
    bin_name: String,
}

impl Staging {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            dir: layout.staging_dir(),
            bin_name: layout.bin_name().to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn prepare(&self) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| FetchError::disk("creating staging directory", e))
    }

    /// Creates an empty staging file for `version`.
    async fn create(&self, version: &Version) -> Result<(tokio::fs::File, TempPath), FetchError> {
        self.prepare().await?;
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-{version}-", self.bin_name))
            .suffix(".partial")
            .tempfile_in(&self.dir)
            .map_err(|e| FetchError::disk("creating staging file", e))?;
        let (file, path) = file.into_parts();
        Ok((tokio::fs::File::from_std(file), path))
    }

    /// Stages in-memory bytes as if they had been downloaded.
    pub async fn stage_bytes(
        &self,
        release: &Release,
        bytes: &[u8],
    ) -> Result<StagedArtifact, FetchError> {
        let (mut file, path) = self.create(&release.version).await?;
        file.write_all(bytes).await.map_err(|e| FetchError::disk("writing staging file", e))?;
        file.sync_all().await.map_err(|e| FetchError::disk("syncing staging file", e))?;

        Ok(StagedArtifact {
            path,
            declared_version: release.version.clone(),
            size: bytes.len() as u64,
            checksum: release.checksum.clone(),
        })
    }

    /// Removes everything left in the staging directory.
    ///
    /// Only call this while no download is in flight, i.e. at startup.
    /// Returns the number of files removed.
    pub async fn sweep(&self) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "Removed orphaned staging file");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staging file"),
            }
        }
        Ok(removed)
    }
}

/// HTTP client for the version server.
pub struct UpdateFetcher {
    client: reqwest::Client,
    server_url: Url,
    staging: Staging,
    request_timeout: Duration,
    download_timeout: Duration,
}

impl UpdateFetcher {
    /// `server_url` must end with `/` so relative URLs resolve beneath it;
    /// [`AgentConfig`](crate::config::AgentConfig) guarantees this.
    pub fn new(server_url: Url, staging: Staging, config: &UpgradeConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hostpulse/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| FetchError::ProtocolError {
                reason: format!("cannot build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            server_url,
            staging,
            request_timeout: config.request_timeout,
            download_timeout: config.download_timeout,
        })
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    /// Convenience for callers only interested in the version number.
    pub async fn latest_version(&self) -> Result<Version, FetchError> {
        Ok(self.latest_release().await?.version)
    }

    async fn fetch_latest(&self) -> Result<Release, FetchError> {
        let url = self.server_url.join("latest").map_err(|e| FetchError::ProtocolError {
            reason: format!("cannot build latest-version URL: {e}"),
        })?;
        debug!(url = %url, "Querying version server");

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(CHECK_OPERATION, e))?;
        let response = check_status(response, CHECK_OPERATION)?;

        let body: LatestResponse =
            response.json().await.map_err(|e| FetchError::from_reqwest(CHECK_OPERATION, e))?;
        body.into_release(&self.server_url)
    }

    async fn fetch_artifact(&self, release: &Release) -> Result<StagedArtifact, FetchError> {
        debug!(url = %release.url, size = release.size, "Downloading artifact");

        let response = self
            .client
            .get(release.url.clone())
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(DOWNLOAD_OPERATION, e))?;
        let mut response = check_status(response, DOWNLOAD_OPERATION)?;

        if let Some(announced) = response.content_length() {
            if announced != release.size {
                return Err(FetchError::TruncatedTransfer {
                    expected: release.size,
                    received: announced,
                });
            }
        }

        let (mut file, path) = self.staging.create(&release.version).await?;
        let mut received: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::from_reqwest(DOWNLOAD_OPERATION, e))?
        {
            received += chunk.len() as u64;
            if received > release.size {
                return Err(FetchError::TruncatedTransfer {
                    expected: release.size,
                    received,
                });
            }
            file.write_all(&chunk).await.map_err(|e| FetchError::disk("writing staging file", e))?;
        }

        if received != release.size {
            return Err(FetchError::TruncatedTransfer {
                expected: release.size,
                received,
            });
        }

        file.sync_all().await.map_err(|e| FetchError::disk("syncing staging file", e))?;
        info!(version = %release.version, bytes = received, "Artifact staged");

        Ok(StagedArtifact {
            path,
            declared_version: release.version.clone(),
            size: received,
            checksum: release.checksum.clone(),
        })
    }
}

impl ReleaseSource for UpdateFetcher {
    fn latest_release(&self) -> impl Future<Output = Result<Release, FetchError>> + Send {
        self.fetch_latest()
    }

    fn download(
        &self,
        release: &Release,
    ) -> impl Future<Output = Result<StagedArtifact, FetchError>> + Send {
        self.fetch_artifact(release)
    }
}

fn check_status(response: Response, operation: &'static str) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(FetchError::NetworkError {
            operation,
            message: format!("server returned {status}"),
        })
    } else {
        Err(FetchError::ProtocolError {
            reason: format!("{operation}: server returned {status}"),
        })
    }
}
