//! Exponential backoff around an async condition.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    /// Factor applied to the interval after every failed attempt; at least 1.
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Total time after which retrying stops.
    pub max_elapsed_time: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(15 * 60),
        }
    }
}

impl BackoffConfig {
    /// Interval to wait after `attempt` failed attempts (0-based).
    pub fn interval(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let nanos = (self.initial_interval.as_nanos() as f64 * factor).round();
        if !nanos.is_finite() || nanos >= self.max_interval.as_nanos() as f64 {
            return self.max_interval;
        }
        Duration::from_nanos(nanos as u64)
    }
}

/// Runs `condition` until it reports done.
///
/// `Ok(true)` finishes, `Ok(false)` sleeps for the next interval and tries again,
/// `Err` aborts immediately with that error. Running past `max_elapsed_time` is an
/// error too.
pub async fn retry_with_backoff<F, Fut>(config: &BackoffConfig, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if condition().await? {
            return Ok(());
        }

        let wait = config.interval(attempt);
        attempt = attempt.saturating_add(1);
        if started.elapsed() + wait > config.max_elapsed_time {
            return Err(anyhow!(
                "condition not met after {} attempts in {:?}",
                attempt,
                started.elapsed()
            ));
        }

        debug!("Attempt {} not done, retrying in {:?}", attempt, wait);
        tokio::time::sleep(wait).await;
    }
}
