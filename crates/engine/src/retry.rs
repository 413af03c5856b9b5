//! Exponential backoff retry for outbound calls.
//!
//! - Default: 3 attempts, sleeping 2s then 4s between them
//! - Each attempt may be bounded by a timeout; an elapsed attempt counts as a failure
//!
//! Sleeps go through the tokio timer so a retrying loop never blocks a worker thread.

use std::future::Future;
use std::time::Duration;

use beacon_common::error::AppError;

/// Bounded-attempt retry with doubling delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of calls, including the first one. Zero is treated as one.
    pub attempts: u32,

    /// Delay before the first retry; doubled before each further retry.
    pub base_delay: Duration,

    /// Upper bound for a single attempt.
    pub call_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        attempts: 3,
        base_delay: Duration::from_secs(2),
        call_timeout: None,
    };

    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            call_timeout: None,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Call `op` until it succeeds or the attempts are exhausted.
    ///
    /// Returns the first success, or the error of the last attempt.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.base_delay;
        let mut attempt = 1;

        loop {
            let result = match self.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Timeout(format!(
                        "{} did not complete within {:?}",
                        what, limit
                    ))),
                },
                None => op().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    tracing::warn!(what, attempts, error = %e, "Giving up after final attempt");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        what,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}
