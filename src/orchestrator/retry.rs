//! Bounded retry with a pause between attempts.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single backoff pause, unless the base pause is already longer.
pub const MAX_BACKOFF_PAUSE: Duration = Duration::from_secs(60);

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause before the second attempt.
    #[serde(with = "humantime_serde")]
    pub pause: Duration,
    /// Multiplier applied to the pause after each failed attempt (1.0 = fixed).
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            pause: Duration::from_secs(1),
            backoff_factor: 1.0,
        }
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Pause to wait after failed attempt number `attempt` (1-based).
    /// Grows by `backoff_factor` and saturates at [`MAX_BACKOFF_PAUSE`].
    pub fn pause_after(&self, attempt: u32) -> Duration {
        let cap = self.pause.max(MAX_BACKOFF_PAUSE);
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.pause.as_secs_f64() * self.backoff_factor.max(0.0).powi(exp);
        Duration::try_from_secs_f64(secs)
            .map(|d| d.min(cap))
            .unwrap_or(cap)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, the
    /// attempt budget is spent, or `cancel` fires during a pause. Always makes
    /// at least one attempt; on cancellation the last error is returned.
    pub async fn run<T, E, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> RetryOutcome<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => {
                    return RetryOutcome {
                        result: Ok(v),
                        attempts: attempt,
                    }
                }
                Err(e) if attempt < max && e.is_retryable() => {
                    let delay = self.pause_after(attempt);
                    tracing::debug!(attempt, max_attempts = max, error = %e, ?delay, "Retrying after failure");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return RetryOutcome {
                                result: Err(e),
                                attempts: attempt,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
