//! Core types for hostpulse
//!
//! Houses the error taxonomy shared by every component. Each stage of the
//! update pipeline reports failures through its own enum so the controller can
//! tell a transient network hiccup from a rejected artifact, while
//! [`ErrorContext`] turns startup failures into operator-friendly messages.
//!
//! # Error Management
//!
//! - [`FetchError`], [`VerifyError`], [`InstallError`] - one per update stage
//! - [`VersionStoreError`] - persisted version state
//! - [`SampleError`] - a single failed metric read
//! - [`AgentError`] - conditions that stop the agent from starting
//! - [`ErrorContext`] / [`user_friendly_error`] - colored CLI rendering

pub mod error;

pub use error::{
    AgentError, ErrorContext, FetchError, InstallError, SampleError, VerifyError,
    VersionStoreError, user_friendly_error,
};
