//! Bounded exponential backoff for calls to remote APIs.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::LumenError;

/// How often and how patiently a remote call is retried.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use lumen_core::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for(1), Duration::from_secs(4));
/// assert_eq!(policy.delay_for(2), Duration::from_secs(8));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `min(base * 2^(n-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// `label` names the call in log lines. The last error is returned as is.
///
/// # Errors
///
/// Returns the first non-retryable error, or the final retryable one.
///
/// # Examples
///
/// ```
/// use lumen_core::{with_backoff, LumenError, RetryPolicy};
///
/// let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
/// let value = rt.block_on(with_backoff(&RetryPolicy::none(), "answer", || async {
///     Ok::<_, LumenError>(42)
/// }));
/// assert_eq!(value.unwrap(), 42);
/// ```
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, LumenError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LumenError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    call = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
