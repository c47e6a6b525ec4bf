//! Backoff for flaky fetches. Used by precaching.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Pause before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single pause.
    pub max_delay: Duration,
    /// Growth factor between pauses.
    pub factor: f64,
    /// Stretch each pause by up to a quarter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Pauses to sleep before attempts 2, 3, ...
    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            next: self.initial_delay,
            remaining: self.max_attempts.max(1) - 1,
        }
    }
}

/// Iterator over the pauses of a [`RetryConfig`].
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a RetryConfig,
    next: Duration,
    remaining: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let base = self.next.min(self.config.max_delay);
        self.next = self.next.mul_f64(self.config.factor).min(self.config.max_delay);

        if self.config.jitter {
            Some(base + base.mul_f64(jitter_fraction() * 0.25))
        } else {
            Some(base)
        }
    }
}

/// Cheap value in `[0, 1)` from the clock; good enough to spread retries.
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    f64::from(nanos % 1_000_000) / 1_000_000.0
}

/// Run `operation` until it succeeds or the attempts in `config` run out.
/// The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut pauses = config.backoff();
    let mut attempt = 1u32;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match pauses.next() {
            Some(pause) => {
                debug!(attempt, ?pause, error = %error, "Attempt failed, backing off");
                sleep(pause).await;
                attempt += 1;
            }
            None => {
                warn!(attempts = attempt, error = %error, "Giving up");
                return Err(error);
            }
        }
    }
}

/// Bound `operation` by `limit`.
pub async fn with_timeout<T, F, Fut>(limit: Duration, operation: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(limit, operation())
        .await
        .map_err(|_| crate::SwCacheError::Timeout(limit))
}
