//! Retry with exponential backoff and rate-limit cool-down.
//!
//! Errors are classified through [`AppError::class`]:
//! - retryable errors back off exponentially (doubling from `base_delay`,
//!   capped at `max_delay`, optional jitter) for at most `max_attempts`
//!   attempts;
//! - rate-limited errors wait out the provider cool-down and are counted
//!   against `max_waits` only;
//! - fatal errors are returned at once.
//!
//! When the budget is exhausted the last error is returned unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::errors::ErrorClass;
use crate::{AppError, Result};

/// Backoff settings for retryable errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Exponent cap; attempts past it keep the same multiplier.
    pub max_exponent: u32,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_exponent: 10,
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Never retry.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        // 2^31 already saturates any realistic base delay.
        let exponent = retry.min(self.max_exponent).min(31);
        let capped = self
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }
        let factor = rand::rng().random_range(0.5..1.5);
        capped.mul_f64(factor).min(self.max_delay)
    }
}

/// Cool-down settings for rate-limited errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitOptions {
    /// Wait out rate limits at all. When false they are returned at once.
    pub enabled: bool,
    /// Wait used when the error carries no hint.
    pub default_cooldown: Duration,
    /// Upper bound on any single wait.
    pub max_cooldown: Duration,
    /// Maximum rate-limit waits per call.
    pub max_waits: u32,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            default_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            max_waits: 3,
        }
    }
}

impl RateLimitOptions {
    /// Wait for a rate-limit error with the given hint.
    #[must_use]
    pub fn cooldown(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(self.default_cooldown)
            .min(self.max_cooldown)
    }
}

/// Bookkeeping for one wrapped call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Calls made, including the first.
    pub attempts: u32,
    /// Backoff retries taken after retryable errors.
    pub retries: u32,
    /// Cool-down waits taken after rate-limit errors.
    pub rate_limit_waits: u32,
    /// Total time slept.
    pub total_delay: Duration,
    /// Class of the most recent error.
    pub last_class: Option<ErrorClass>,
}

/// Run `operation` under the retry and rate-limit policy.
///
/// # Errors
///
/// The first fatal error, or the last error once the relevant budget is
/// exhausted.
pub async fn with_retry<F, Fut, T>(
    operation: F,
    retry: &RetryOptions,
    rate_limit: &RateLimitOptions,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_state(operation, retry, rate_limit).await.0
}

/// Like [`with_retry`], also returning the final [`RetryState`].
pub async fn retry_with_state<F, Fut, T>(
    mut operation: F,
    retry: &RetryOptions,
    rate_limit: &RateLimitOptions,
) -> (Result<T>, RetryState)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::default();

    loop {
        state.attempts += 1;
        let err = match operation().await {
            Ok(value) => {
                if state.attempts > 1 {
                    debug!(attempts = state.attempts, "succeeded after retry");
                }
                return (Ok(value), state);
            }
            Err(err) => err,
        };

        let class = err.class();
        state.last_class = Some(class);
        let Some(delay) = next_delay(&err, class, &mut state, retry, rate_limit) else {
            return (Err(err), state);
        };

        warn!(
            attempt = state.attempts,
            class = ?class,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %err,
            "retrying"
        );
        state.total_delay += delay;
        tokio::time::sleep(delay).await;
    }
}

/// Delay before the next attempt, or `None` to give up. Updates counters.
fn next_delay(
    err: &AppError,
    class: ErrorClass,
    state: &mut RetryState,
    retry: &RetryOptions,
    rate_limit: &RateLimitOptions,
) -> Option<Duration> {
    match class {
        ErrorClass::Fatal => {
            debug!(%err, "not retryable");
            None
        }
        ErrorClass::RateLimited => {
            if !rate_limit.enabled || state.rate_limit_waits >= rate_limit.max_waits {
                warn!(waits = state.rate_limit_waits, "rate-limit waits exhausted");
                return None;
            }
            let hint = match err {
                AppError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };
            state.rate_limit_waits += 1;
            Some(rate_limit.cooldown(hint))
        }
        ErrorClass::Retryable => {
            if state.retries + 1 >= retry.max_attempts {
                warn!(attempts = retry.max_attempts, "retry attempts exhausted");
                return None;
            }
            let delay = retry.delay(state.retries);
            state.retries += 1;
            Some(delay)
        }
    }
}
