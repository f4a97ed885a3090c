//! Backoff policies for retried asset fetches.
//!
//! Install-time precaching may retry individual assets before declaring the
//! batch failed; the hosting environment still owns retry of the install
//! cycle itself, so the default policy is a single attempt.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy for a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts (1 = no retries).
    pub attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Growth factor between attempts.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl BackoffPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            cap: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Exponential policy with the given attempt count.
    pub fn exponential(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    /// Delay to wait before the given attempt (1-indexed).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32 - 2);
        Duration::from_secs_f64(exp.min(self.cap.as_secs_f64()))
    }
}

/// Run a fallible async operation under a backoff policy.
///
/// Returns the first success, or the last error once attempts are exhausted.
pub async fn run_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_err = None;

    for attempt in 1..=policy.attempts.max(1) {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            debug!(attempt, ?delay, "Waiting before retry");
            sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, attempts = policy.attempts, error = %e, "Attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt runs"))
}
