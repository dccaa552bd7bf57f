//! Self-update subsystem.
//!
//! The agent periodically asks a version server for the latest release and,
//! when a newer one exists, replaces its own binary and restarts into it. The
//! host must never be left with a half-written or unverified binary, whatever
//! goes wrong along the way: network errors, truncated downloads, bad
//! artifacts, or a crash in the middle of the swap.
//!
//! # Architecture Overview
//!
//! ## Core Components
//!
//! - **[`UpdateController`]**: the state machine that drives one update cycle
//!   and the timer that repeats it
//! - **[`UpdateFetcher`]**: HTTP client for the version server; downloads into
//!   a staging directory next to the binary
//! - **[`ArtifactVerifier`]**: checksum, size, header and pluggable trust checks
//! - **[`Installer`]**: atomic rename over the install path, then re-exec
//! - **[`backup::BackupManager`]**: keeps the previous binary for `--rollback`
//! - **[`install_lock::InstallLock`]**: serializes installs and rollbacks
//!   across processes
//! - **[`config::UpgradeConfig`]**: the `[upgrade]` configuration table
//!
//! ## Update Cycle Flow
//!
//! ```text
//! 1. Checking
//!    └── GET {server}/latest, retried with backoff on transient errors
//!
//! 2. Downloading (only if strictly newer)
//!    ├── Stream into .<bin>.staging/ on the install filesystem
//!    └── Reject short or oversized transfers
//!
//! 3. Verifying
//!    ├── Size and SHA-256 against the announced values
//!    ├── Executable header for this platform
//!    └── Registered ArtifactCheck hooks
//!
//! 4. Installing (under .<bin>.lock)
//!    ├── Copy live binary to <bin>.backup
//!    ├── rename() staged file over the install path
//!    └── Commit the new current version
//!
//! 5. Restarting
//!    └── exec() the new binary, or exit for a supervisor
//! ```
//!
//! Any failure in steps 1-4 appends an [`UpdateRecord`](crate::version_store::UpdateRecord),
//! deletes the staged file, and returns to `Idle` until the next tick.
//!
//! # Safety Mechanisms
//!
//! - **Staging on the same filesystem**: the final `rename` is atomic, so the
//!   install path always holds either the old or the new binary.
//! - **Typed verification**: [`Installer::install`] only accepts a
//!   [`VerifiedArtifact`], which only [`ArtifactVerifier::verify`] creates.
//! - **Crash cleanup**: staged files delete themselves on drop; files orphaned
//!   by a crash are swept at startup.
//! - **Monotonic versions**: the version store refuses to commit anything
//!   that is not newer than the current version.

pub mod backup;
pub mod config;
pub mod controller;
pub mod fetcher;
pub mod install_lock;
pub mod installer;
pub mod verification;


pub use config::{RestartMode, UpgradeConfig};
pub use controller::{ControllerExit, CycleResult, UpdateController, UpdateState};
pub use fetcher::{Release, ReleaseSource, StagedArtifact, Staging, UpdateFetcher};
pub use installer::{InstallReceipt, Installer};
pub use verification::{ArtifactCheck, ArtifactVerifier, VerifiedArtifact};
