//! Retry and timeout utilities.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Longest pause between two attempts.
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Backoff schedule for retrying a rejected operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Pause before the second attempt; each later pause doubles.
    pub initial_delay: Duration,
    /// Cap on any single pause.
    pub max_delay: Duration,
    /// Stretch each pause by up to a quarter.
    pub jitter: bool,
}

impl RetryConfig {
    /// `max_attempts` tries, doubling from `initial_delay`.
    pub fn attempts(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: MAX_DELAY,
            jitter: true,
        }
    }

    /// Use exact pauses.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Pause before `attempt` (1-indexed). The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let doublings = (attempt - 2).min(16);
        let delay = self
            .initial_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay);

        if self.jitter {
            delay + delay.mul_f64(jitter_fraction())
        } else {
            delay
        }
    }
}

/// Clock-derived fraction in `0.0..0.25`.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    f64::from(nanos % 1_000) / 4_000.0
}

/// Retry a fallible async operation with exponential backoff.
///
/// A `max_attempts` of zero is treated as one attempt. The error of the final
/// attempt is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(attempt, max_attempts, error = %e, "Operation failed, giving up");
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                let delay = config.delay_before(attempt);
                debug!(attempt, ?delay, error = %e, "Retrying after delay");
                sleep(delay).await;
            }
        }
    }
}

/// The operation passed to [`with_timeout`] did not finish in time.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, TimedOut>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| TimedOut(timeout))
}
