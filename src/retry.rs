use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded retry with multiplicative backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    #[serde(with = "crate::config::millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
        }
    }

    /// Delay to wait after the `failures`-th failed attempt.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(failures.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// Run `op` until it succeeds, hits a non-retryable error, or runs out of attempts.
/// The last error is returned on failure.
pub async fn retry_async<T, E, F, Fut, R>(policy: &RetryPolicy, mut op: F, retryable: R) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                failures += 1;
                if failures >= attempts || !retryable(&e) {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_after(failures)).await;
            }
        }
    }
}
