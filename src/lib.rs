//! hostpulse - a self-updating host agent
//!
//! A long-lived agent that samples local resource utilization (CPU, memory,
//! disk) and periodically replaces its own binary with newer releases from a
//! version server, without interrupting monitoring and without ever leaving
//! the host with a half-written or unverified binary.
//!
//! # Architecture Overview
//!
//! Two independent loops share one runtime:
//!
//! - the **monitor loop** samples the host on a fixed interval and reports
//!   samples plus threshold alerts to a sink
//! - the **update controller** checks the version server on its own interval
//!   and walks each new release through download, verification and install
//!
//! They share nothing except a shutdown channel, so a slow download never
//! delays a sample.
//!
//! # Core Modules
//!
//! ## Update pipeline
//! - [`upgrade`] - fetcher, verifier, installer, backup, lock and the controller
//! - [`version_store`] - durable current version and the update history
//!
//! ## Monitoring
//! - [`monitor`] - samplers, threshold evaluation and the monitor loop
//!
//! ## Runtime
//! - [`agent`] - wires both loops together for the process lifetime
//! - [`cli`] - command-line parsing, logging setup and one-shot modes
//! - [`config`] - TOML config file, CLI overrides and the install layout
//!
//! ## Supporting modules
//! - [`core`] - error types and operator-facing error rendering
//! - [`constants`] - defaults and tunables
//! - [`utils`] - retry/backoff, shutdown signalling and durable file writes
//!
//! # On-disk Layout
//!
//! Everything the agent persists lives next to the binary it manages:
//!
//! ```text
//! /opt/hostpulse/bin/
//! ├── hostpulse                     # the managed binary
//! ├── hostpulse.backup              # previous binary, for --rollback
//! ├── .hostpulse.state.json         # current/previous version
//! ├── .hostpulse.history.jsonl      # append-only update records
//! ├── .hostpulse.lock               # install lock
//! └── .hostpulse.staging/           # in-progress downloads
//! ```
//!
//! # Version Server Contract
//!
//! ```text
//! GET {server}/latest  -> {"version": "2.0.0", "url": "...", "checksum": "<sha256 hex>", "size": 1234}
//! GET {url}            -> raw artifact bytes
//! ```
//!
//! `url` may be absolute or relative to the server URL. 5xx responses and
//! timeouts are retried with backoff; anything else unexpected is not.

pub mod agent;
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod monitor;
pub mod upgrade;
pub mod utils;
pub mod version_store;

// test_utils module is available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
