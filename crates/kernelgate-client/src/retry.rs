//! Bounded retry with exponential backoff.
//!
//! Only transient errors ([`GatewayError::is_transient`]) are retried.
//! Anything else propagates on first occurrence. Delay before retry `n`
//! (0-based) is `base_delay * 2^n`, capped at `max_delay`, optionally with
//! equal jitter (uniform in `[d/2, d]`).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MAX_DELAY};
use crate::error::GatewayError;

/// How many times to retry and how long to wait in between.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let spread = rand::thread_rng().gen_range(0..=half.as_micros() as u64);
        half + Duration::from_micros(spread)
    }
}

/// Run `op` until it succeeds, fails non-transiently, or retries run out.
///
/// `op` receives the 0-based attempt number. On exhaustion the last
/// transient error is returned wrapped in [`GatewayError::RetriesExhausted`].
pub async fn with_retry<T, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_retries => {
                warn!(operation, attempts = attempt + 1, error = %e, "retries exhausted");
                return Err(GatewayError::RetriesExhausted {
                    operation,
                    attempts: attempt + 1,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Fails transiently `failures` times, then succeeds with the attempt number.
    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32, GatewayError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(GatewayError::Transport("connection refused".into()))
        } else {
            Ok(n)
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let policy = RetryPolicy::new(3, Duration::from_millis(400));
        for _ in 0..100 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(800));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_failures_with_n_retries_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10)).without_jitter();

        let result = with_retry("launch", &policy, |_| flaky(&calls, 3)).await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_n_plus_one_failures_exhausts_after_n_retries() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10)).without_jitter();

        let result = with_retry("launch", &policy, |_| flaky(&calls, 4)).await;

        match result {
            Err(GatewayError::RetriesExhausted { operation, attempts, last }) => {
                assert_eq!(operation, "launch");
                assert_eq!(attempts, 4);
                assert!(matches!(*last, GatewayError::Transport(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_are_exponential() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(100)).without_jitter();

        let start = Instant::now();
        let _ = with_retry("launch", &policy, |_| flaky(&calls, 10)).await;

        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_semantic_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(10));

        let result: Result<(), _> = with_retry("launch", &policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GatewayError::LaunchRejected {
                    status: 400,
                    message: "unknown kernelspec".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(GatewayError::LaunchRejected { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retries_policy_annotates_single_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry("execute", &RetryPolicy::none(), |_| flaky(&calls, 1)).await;
        assert!(matches!(result, Err(GatewayError::RetriesExhausted { attempts: 1, .. })));
    }
}
