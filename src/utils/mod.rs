//! Utility modules shared by the update pipeline and the agent.
//!
//! - [`fs`] - atomic writes, fsync'd appends and path helpers
//! - [`backoff`] - capped doubling backoff and the retry loop
//! - [`shutdown`] - cooperative shutdown between the agent's loops

pub mod backoff;
pub mod fs;
pub mod shutdown;

pub use backoff::{RetryPolicy, Transient, retry_transient};
pub use fs::{atomic_write, ensure_dir};
pub use shutdown::{ShutdownListener, ShutdownTrigger};
