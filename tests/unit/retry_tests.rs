//! Unit tests for the retry wrapper.
//!
//! Delays are a few milliseconds so the real clock can be used.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_conduit::errors::ErrorClass;
use agent_conduit::retry::{retry_with_state, with_retry, RateLimitOptions, RetryOptions};
use agent_conduit::AppError;

fn quick_retry(max_attempts: u32) -> RetryOptions {
    RetryOptions {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_exponent: 10,
        jitter: false,
    }
}

fn quick_rate_limit(max_waits: u32) -> RateLimitOptions {
    RateLimitOptions {
        enabled: true,
        default_cooldown: Duration::from_millis(2),
        max_cooldown: Duration::from_millis(10),
        max_waits,
    }
}

fn rate_limited() -> AppError {
    AppError::RateLimited {
        message: "429".into(),
        retry_after: Some(Duration::from_millis(3)),
    }
}

#[tokio::test]
async fn retryable_error_then_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let value = with_retry(
        || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::Timeout("slow".into()))
                } else {
                    Ok("done")
                }
            }
        },
        &quick_retry(3),
        &quick_rate_limit(3),
    )
    .await
    .expect("third attempt succeeds");
    assert_eq!(value, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_budget_exhausted_returns_last_error() {
    let (result, state) = retry_with_state(
        || async { Err::<(), _>(AppError::TransportClosed("gone".into())) },
        &quick_retry(3),
        &quick_rate_limit(3),
    )
    .await;
    assert!(matches!(result, Err(AppError::TransportClosed(_))));
    assert_eq!(state.attempts, 3);
    assert_eq!(state.retries, 2);
    assert_eq!(state.last_class, Some(ErrorClass::Retryable));
}

#[tokio::test]
async fn fatal_error_is_not_retried() {
    let (result, state) = retry_with_state(
        || async { Err::<(), _>(AppError::Protocol("bad".into())) },
        &quick_retry(5),
        &quick_rate_limit(3),
    )
    .await;
    assert!(matches!(result, Err(AppError::Protocol(_))));
    assert_eq!(state.attempts, 1);
    assert_eq!(state.total_delay, Duration::ZERO);
}

#[tokio::test]
async fn rate_limit_waits_do_not_consume_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let (result, state) = retry_with_state(
        || {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(rate_limited()),
                    2 => Err(AppError::Timeout("blip".into())),
                    _ => Ok(42),
                }
            }
        },
        // One retry only; the two rate-limit waits must not use it up.
        &quick_retry(2),
        &quick_rate_limit(2),
    )
    .await;
    assert_eq!(result.expect("eventually ok"), 42);
    assert_eq!(state.rate_limit_waits, 2);
    assert_eq!(state.retries, 1);
    assert_eq!(state.attempts, 4);
    assert!(state.total_delay >= Duration::from_millis(6));
}

#[tokio::test]
async fn rate_limit_waits_exhausted() {
    let (result, state) = retry_with_state(
        || async { Err::<(), _>(rate_limited()) },
        &quick_retry(5),
        &quick_rate_limit(1),
    )
    .await;
    assert!(matches!(result, Err(AppError::RateLimited { .. })));
    assert_eq!(state.rate_limit_waits, 1);
    assert_eq!(state.attempts, 2);
}

#[tokio::test]
async fn disabled_rate_limit_propagates_immediately() {
    let disabled = RateLimitOptions {
        enabled: false,
        ..quick_rate_limit(3)
    };
    let (result, state) =
        retry_with_state(|| async { Err::<(), _>(rate_limited()) }, &quick_retry(5), &disabled)
            .await;
    assert!(result.is_err());
    assert_eq!(state.attempts, 1);
}

#[test]
fn none_means_single_attempt() {
    assert_eq!(RetryOptions::none().max_attempts, 1);
}
