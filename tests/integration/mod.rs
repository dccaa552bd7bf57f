//! Integration test suite for hostpulse
//!
//! End-to-end tests that drive the real HTTP fetcher against a local version
//! server and run the compiled binary to check exit codes and output.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **update_cycle**: full check/download/verify/install cycles over HTTP
//! - **cli**: the `hostpulse` binary's one-shot modes and startup failures

// Shared test utilities (from parent tests/ directory)
#[path = "../common/mod.rs"]
mod common;

mod cli;
mod update_cycle;
