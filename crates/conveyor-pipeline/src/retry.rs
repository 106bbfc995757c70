//! Retry logic with configurable backoff, used for environment provisioning.

use std::future::Future;
use std::time::Duration;

use conveyor_types::{ConveyorError, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed {
        #[serde(with = "conveyor_types::duration_serde")]
        delay: Duration,
    },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential {
        #[serde(with = "conveyor_types::duration_serde")]
        base: Duration,
        #[serde(with = "conveyor_types::duration_serde")]
        max: Duration,
    },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64)
                    .saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Call `f` up to `max_retries + 1` times, retrying while the error satisfies
/// [`ConveyorError::is_retryable`].
///
/// Between attempts it sleeps for the delay dictated by `policy`, calling
/// `on_retry(attempt, delay, &error)` first. Cancellation of `cancel` during
/// the sleep ends the loop with [`ConveyorError::Cancelled`].
pub async fn retry_with_backoff<T, F, Fut, R>(
    mut f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut on_retry: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnMut(usize, Duration, &ConveyorError),
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                on_retry(attempt + 1, delay, &e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ConveyorError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
