//! Exponential backoff utilities for retry operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::utils::shutdown::ShutdownListener;

/// Errors that may succeed when the same operation is attempted again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Capped doubling backoff with a bounded number of attempts.
///
/// Delays run `initial_delay`, `2 * initial_delay`, `4 * initial_delay`, ...
/// and never exceed `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delay to wait after the failed attempt with the given 0-based index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only errors whose [`Transient::is_transient`] returns `true` are retried.
/// A shutdown arriving while waiting between attempts abandons the loop and
/// returns the last error instead of sleeping out the delay.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &ShutdownListener,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );

                let mut shutdown = shutdown.clone();
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = shutdown.triggered() => {
                        debug!(operation = operation_name, "Shutdown during backoff, giving up");
                        return Err(error);
                    }
                }
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
