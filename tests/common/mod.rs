//! Common test utilities for hostpulse integration tests
//!
//! [`VersionServer`] is a local stand-in for the real version server. It
//! serves `GET /latest` and `GET /artifacts/{name}` on an ephemeral port and
//! can be told to misbehave: hang, return errors, announce the wrong checksum
//! or size, or answer with malformed JSON.

// Not every test file uses every helper
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hostpulse::test_utils::sha256_hex;
use serde_json::json;
use tokio::task::JoinHandle;

/// What `/latest` announces and `/artifacts/...` serves.
#[derive(Clone)]
struct Published {
    version: String,
    payload: Vec<u8>,
    checksum: String,
    size: u64,
}

impl Published {
    fn artifact_name(&self) -> String {
        format!("hostpulse-{}", self.version)
    }
}

#[derive(Default)]
struct Inner {
    published: Mutex<Option<Published>>,
    malformed_latest: Mutex<Option<String>>,
    hang_latest: AtomicU32,
    fail_latest: AtomicU32,
    fail_status: Mutex<Option<StatusCode>>,
    latest_hits: AtomicU32,
    artifact_hits: AtomicU32,
}

#[derive(Clone, Default)]
struct ServerState(Arc<Inner>);

/// Decrements `counter` if positive; true when the request should misbehave.
fn take(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

async fn latest(State(state): State<ServerState>) -> Response {
    let inner = &state.0;
    inner.latest_hits.fetch_add(1, Ordering::SeqCst);

    if take(&inner.hang_latest) {
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
    if take(&inner.fail_latest) {
        let status = inner.fail_status.lock().unwrap().unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return status.into_response();
    }
    if let Some(body) = inner.malformed_latest.lock().unwrap().clone() {
        return ([(header::CONTENT_TYPE, "application/json")], body).into_response();
    }

    let published = inner.published.lock().unwrap().clone();
    match published {
        Some(p) => axum::Json(json!({
            "version": p.version,
            "url": format!("artifacts/{}", p.artifact_name()),
            "checksum": p.checksum,
            "size": p.size,
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn artifact(State(state): State<ServerState>, Path(name): Path<String>) -> Response {
    let inner = &state.0;
    inner.artifact_hits.fetch_add(1, Ordering::SeqCst);

    let published = inner.published.lock().unwrap().clone();
    match published {
        Some(p) if p.artifact_name() == name => p.payload.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// A version server on `127.0.0.1:<ephemeral>`, stopped on drop.
pub struct VersionServer {
    addr: SocketAddr,
    state: ServerState,
    handle: JoinHandle<()>,
}

impl VersionServer {
    pub async fn start() -> Self {
        let state = ServerState::default();
        let app = Router::new()
            .route("/latest", get(latest))
            .route("/artifacts/:name", get(artifact))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    /// Base URL with trailing slash.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Publish `payload` as `version` with its real checksum and size.
    pub fn publish(&self, version: &str, payload: Vec<u8>) {
        let published = Published {
            version: version.to_string(),
            checksum: sha256_hex(&payload),
            size: payload.len() as u64,
            payload,
        };
        *self.state.0.published.lock().unwrap() = Some(published);
    }

    /// Announce `checksum` instead of the payload's digest.
    pub fn announce_checksum(&self, checksum: &str) {
        if let Some(p) = self.state.0.published.lock().unwrap().as_mut() {
            p.checksum = checksum.to_string();
        }
    }

    /// Announce `size` instead of the payload's length.
    pub fn announce_size(&self, size: u64) {
        if let Some(p) = self.state.0.published.lock().unwrap().as_mut() {
            p.size = size;
        }
    }

    /// The next `n` `/latest` requests hang for a minute.
    pub fn hang_latest(&self, n: u32) {
        self.state.0.hang_latest.store(n, Ordering::SeqCst);
    }

    /// The next `n` `/latest` requests answer with `status`.
    pub fn fail_latest(&self, n: u32, status: StatusCode) {
        *self.state.0.fail_status.lock().unwrap() = Some(status);
        self.state.0.fail_latest.store(n, Ordering::SeqCst);
    }

    /// `/latest` answers with `body` from now on.
    pub fn malformed_latest(&self, body: &str) {
        *self.state.0.malformed_latest.lock().unwrap() = Some(body.to_string());
    }

    pub fn latest_hits(&self) -> u32 {
        self.state.0.latest_hits.load(Ordering::SeqCst)
    }

    pub fn artifact_hits(&self) -> u32 {
        self.state.0.artifact_hits.load(Ordering::SeqCst)
    }
}

impl Drop for VersionServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
