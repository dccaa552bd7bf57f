use semver::Version;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::core::VerifyError;
use crate::upgrade::fetcher::StagedArtifact;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Extra acceptance check run after the checksum and header checks pass.
///
/// This is the seam for signature verification: the agent ships no trust
/// root of its own, so deployments that sign artifacts plug a check in here.
pub trait ArtifactCheck: Send + Sync {
    /// `sha256` is the lowercase hex digest of the staged file.
    fn check(&self, artifact: &StagedArtifact, sha256: &str) -> Result<(), VerifyError>;
}

/// A staged artifact that passed every check of this cycle's verifier.
///
/// Only [`ArtifactVerifier::verify`] constructs this type, and the installer
/// accepts nothing else.
#[derive(Debug)]
pub struct VerifiedArtifact {
    artifact: StagedArtifact,
    sha256: String,
}

impl VerifiedArtifact {
    pub fn version(&self) -> &Version {
        &self.artifact.declared_version
    }

    pub fn path(&self) -> &Path {
        self.artifact.path()
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub(crate) fn into_staged(self) -> StagedArtifact {
        self.artifact
    }
}

/// Validates staged downloads before they may be installed.
///
/// # Checks, in order
///
/// 1. The file size equals the size the server announced.
/// 2. The SHA-256 digest matches the announced checksum. Comparison is
///    case-insensitive and accepts an optional `sha256:` prefix.
/// 3. Optionally, the file starts with an executable header for this
///    platform (ELF, Mach-O, PE, or a `#!` script).
/// 4. Every registered [`ArtifactCheck`].
///
/// The first failing check rejects the artifact; its staged file is deleted
/// when the rejected [`StagedArtifact`] is dropped.
pub struct ArtifactVerifier {
    verify_executable: bool,
    checks: Vec<Box<dyn ArtifactCheck>>,
}

impl ArtifactVerifier {
    pub fn new(verify_executable: bool) -> Self {
        Self {
            verify_executable,
            checks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_check(mut self, check: impl ArtifactCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Compute the SHA256 checksum of a file as lowercase hex.
    ///
    /// The file is streamed, so large artifacts are never held in memory.
    pub async fn compute_sha256(file_path: &Path) -> Result<String, VerifyError> {
        debug!("Computing SHA256 checksum for: {:?}", file_path);

        let mut file = tokio::fs::File::open(file_path)
            .await
            .map_err(|source| VerifyError::DiskError {
                operation: "opening staged artifact",
                source,
            })?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = file.read(&mut buffer).await.map_err(|source| VerifyError::DiskError {
                operation: "reading staged artifact",
                source,
            })?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    pub async fn verify(&self, artifact: StagedArtifact) -> Result<VerifiedArtifact, VerifyError> {
        info!(version = %artifact.declared_version, "Verifying staged artifact");

        let on_disk = tokio::fs::metadata(artifact.path())
            .await
            .map_err(|source| VerifyError::DiskError {
                operation: "reading staged artifact metadata",
                source,
            })?
            .len();
        if on_disk != artifact.size {
            return Err(VerifyError::InvalidArtifact {
                reason: format!("size is {on_disk} bytes, expected {}", artifact.size),
            });
        }

        let expected = normalize_checksum(&artifact.checksum);
        let actual = Self::compute_sha256(artifact.path()).await?;
        if actual != expected {
            return Err(VerifyError::ChecksumMismatch { expected, actual });
        }

        if self.verify_executable {
            let header = read_header(artifact.path()).await?;
            check_executable_header(&header)?;
        }

        for check in &self.checks {
            check.check(&artifact, &actual)?;
        }

        info!(version = %artifact.declared_version, sha256 = %actual, "Artifact verified");
        Ok(VerifiedArtifact {
            artifact,
            sha256: actual,
        })
    }
}

/// Lowercase hex without an optional `sha256:` prefix.
pub fn normalize_checksum(raw: &str) -> String {
    let trimmed = raw.trim();
    let hex = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };
    hex.to_ascii_lowercase()
}

async fn read_header(path: &Path) -> Result<Vec<u8>, VerifyError> {
    let mut file = tokio::fs::File::open(path).await.map_err(|source| VerifyError::DiskError {
        operation: "opening staged artifact",
        source,
    })?;
    let mut header = Vec::with_capacity(4);
    (&mut file)
        .take(4)
        .read_to_end(&mut header)
        .await
        .map_err(|source| VerifyError::DiskError {
            operation: "reading artifact header",
            source,
        })?;
    Ok(header)
}

const SHEBANG: &[u8] = b"#!";
const ELF: &[u8] = b"\x7fELF";
const PE: &[u8] = b"MZ";
const MACH_O: [&[u8]; 5] = [
    b"\xfe\xed\xfa\xce",
    b"\xfe\xed\xfa\xcf",
    b"\xce\xfa\xed\xfe",
    b"\xcf\xfa\xed\xfe",
    b"\xca\xfe\xba\xbe",
];

/// Accepts scripts everywhere and the native binary format of this platform.
fn check_executable_header(header: &[u8]) -> Result<(), VerifyError> {
    if header.starts_with(SHEBANG) {
        return Ok(());
    }

    let (format, accepted) = if cfg!(target_os = "windows") {
        ("PE", header.starts_with(PE))
    } else if cfg!(target_os = "macos") {
        ("Mach-O", MACH_O.iter().any(|magic| header.starts_with(magic)))
    } else if cfg!(unix) {
        ("ELF", header.starts_with(ELF))
    } else {
        return Ok(());
    };

    if accepted {
        Ok(())
    } else {
        Err(VerifyError::InvalidArtifact {
            reason: format!("not a {format} executable or script"),
        })
    }
}
