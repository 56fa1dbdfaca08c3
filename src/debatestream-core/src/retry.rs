//! Bounded exponential backoff with jitter.
//!
//! Two combinators cover every external call in the stream: [`retry`]
//! propagates the last error once the budget is spent (render, poll,
//! download), [`retry_or_else`] turns exhaustion into a locally produced
//! fallback value (text generation, speech synthesis).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::warn;

use crate::error::StreamError;

/// Lower and upper bound of the multiplicative jitter factor.
pub const JITTER_LOW: f64 = 0.7;
pub const JITTER_HIGH: f64 = 1.3;

/// Retry budget for one category of external call.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_retries: u32,
    pub base_delay_s: f64,
    pub max_delay_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_s: 0.8,
            max_delay_s: 10.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_s: f64, max_delay_s: f64) -> Self {
        Self {
            max_retries,
            base_delay_s,
            max_delay_s,
        }
    }

    /// Delay after the `attempt`-th failure (1-based) before jitter.
    pub fn nominal_delay_s(&self, attempt: u32) -> f64 {
        let exp = attempt.saturating_sub(1).min(30);
        self.base_delay_s.max(0.0) * f64::from(1u32 << exp)
    }

    /// Jittered delay, capped at `max_delay_s`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = rand::rng().random_range(JITTER_LOW..=JITTER_HIGH);
        let secs = (self.nominal_delay_s(attempt) * factor).min(self.max_delay_s.max(0.0));
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` until it succeeds, the error is permanent, or the budget is spent.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, name: &str, mut op: F) -> Result<T, StreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= attempts || !err.is_transient() {
                    warn!(
                        target: "retry",
                        op = name,
                        attempt,
                        max = attempts,
                        error = %err,
                        "giving up"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    target: "retry",
                    op = name,
                    attempt,
                    max = attempts,
                    delay_s = format!("{:.1}", delay.as_secs_f64()),
                    error = %err,
                    "failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Like [`retry`], but exhaustion yields `fallback(last_error)` instead of an error.
pub async fn retry_or_else<T, F, Fut, D>(policy: &RetryPolicy, name: &str, op: F, fallback: D) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
    D: FnOnce(StreamError) -> T,
{
    match retry(policy, name, op).await {
        Ok(value) => value,
        Err(err) => fallback(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> StreamError {
        StreamError::Timeout("simulated".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fails_twice_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, 0.8, 10.0);

        let counter = calls.clone();
        let result = retry(&policy, "flaky", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= 2 { Err(transient()) } else { Ok(42) }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_propagates_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(4, 0.5, 10.0);
        let started = tokio::time::Instant::now();

        let counter = calls.clone();
        let result: Result<(), StreamError> = retry(&policy, "down", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(StreamError::Timeout(format!("attempt {n}")))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(StreamError::Timeout(msg)) => assert_eq!(msg, "attempt 4"),
            other => panic!("unexpected result: {other:?}"),
        }

        // Three sleeps: 0.5, 1.0 and 2.0 nominal seconds.
        let elapsed = started.elapsed().as_secs_f64();
        assert!(elapsed >= 3.5 * JITTER_LOW - 1e-6, "slept {elapsed}");
        assert!(elapsed <= 3.5 * JITTER_HIGH + 1e-6, "slept {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();

        let counter = calls.clone();
        let result: Result<(), StreamError> = retry(&policy, "config", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StreamError::ConfigError("no character id".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_stays_within_jitter_band() {
        let policy = RetryPolicy::new(6, 0.8, 10.0);
        for attempt in 1..=4 {
            let nominal = policy.nominal_delay_s(attempt);
            for _ in 0..200 {
                let d = policy.delay_for_attempt(attempt).as_secs_f64();
                assert!(d >= nominal * JITTER_LOW - 1e-9);
                assert!(d <= (nominal * JITTER_HIGH).min(10.0) + 1e-9);
            }
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, 0.8, 2.0);
        for _ in 0..100 {
            assert!(policy.delay_for_attempt(8).as_secs_f64() <= 2.0 + 1e-9);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_or_else_uses_fallback() {
        let policy = RetryPolicy::new(2, 0.1, 1.0);
        let text = retry_or_else(
            &policy,
            "llm",
            || async { Err::<String, _>(transient()) },
            |_| "bridge".to_string(),
        )
        .await;
        assert_eq!(text, "bridge");
    }
}
