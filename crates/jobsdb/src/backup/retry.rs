//! Bounded exponential backoff for archival uploads.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Exponential backoff bounded by total elapsed time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_interval: Duration,
    /// No attempt starts after this much time has passed since the first one
    pub max_elapsed_time: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 2.0,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_elapsed_time(mut self, max_elapsed_time: Duration) -> Self {
        self.max_elapsed_time = max_elapsed_time;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Calculate delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.initial_interval.as_millis() as f64;
        let max_ms = self.max_interval.as_millis() as f64;
        let exp = self.multiplier.powi((attempt - 1) as i32);

        Duration::from_millis((base_ms * exp).min(max_ms).max(0.0) as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("cancelled")]
    Cancelled,
}

/// Run `op` until it succeeds, the policy's elapsed-time bound is reached,
/// or `cancel` fires. `op` receives the 1-indexed attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let delay = policy.delay_for_attempt(attempt);
        if started.elapsed() + delay > policy.max_elapsed_time {
            return Err(RetryError::Exhausted { attempts: attempt, last: err });
        }
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed, retrying");

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
