//! Bounded retry with exponential backoff and jitter
//!
//! The delay before attempt `n + 1` is
//! `min(base_delay * multiplier^(n - 1), max_delay)`, scaled by a uniform
//! factor in `[0.5, 1.0]` when jitter is enabled. Only errors accepted by the
//! predicate are retried; the last error is returned unchanged.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Retry parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryPolicy {
    /// Remote API calls
    pub fn network() -> Self {
        Self::preset(5, Duration::from_secs(2), Duration::from_secs(30))
    }

    /// Ledger submission and confirmation
    pub fn blockchain() -> Self {
        Self::preset(3, Duration::from_secs(5), Duration::from_secs(60))
    }

    pub fn file_io() -> Self {
        Self::preset(3, Duration::from_secs(1), Duration::from_secs(10))
    }

    pub fn quick() -> Self {
        Self::preset(2, Duration::from_millis(500), Duration::from_secs(5))
    }

    fn preset(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before the retry that follows failed attempt `attempt`
    /// (1-indexed), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    /// Backoff for `attempt` with jitter applied when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    /// Run `operation`, retrying every error.
    pub async fn run<F, Fut, T, E>(&self, context: &str, operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_with_predicate(context, operation, |_| true).await
    }

    /// Run `operation`, retrying only errors for which `should_retry` holds.
    pub async fn run_with_predicate<F, Fut, T, E, P>(
        &self,
        context: &str,
        mut operation: F,
        should_retry: P,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        let mut delays = Vec::new();

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(
                            context = context,
                            attempts = attempts,
                            "Operation succeeded after retries"
                        );
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        delays,
                    };
                }
                Err(e) => {
                    if !should_retry(&e) {
                        tracing::warn!(
                            context = context,
                            attempt = attempts,
                            error = %e,
                            "Operation failed with a non-retryable error"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts,
                            delays,
                        };
                    }
                    if attempts >= max_attempts {
                        tracing::error!(
                            context = context,
                            attempts = attempts,
                            error = %e,
                            "Operation failed after all attempts"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts,
                            delays,
                        };
                    }

                    let delay = self.delay_for_attempt(attempts);
                    tracing::warn!(
                        context = context,
                        attempt = attempts,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, will retry"
                    );

                    tokio::time::sleep(delay).await;
                    delays.push(delay);
                }
            }
        }
    }
}

/// What a retried operation returned, and how it got there
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    /// Every backoff slept, in order
    pub delays: Vec<Duration>,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Retry `operation` under `policy`, retrying errors accepted by `should_retry`.
pub async fn retry<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    context: &str,
    operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    policy
        .run_with_predicate(context, operation, should_retry)
        .await
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuditError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::quick()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::network().with_jitter(false);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(100), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::blockchain();
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_presets() {
        let network = RetryPolicy::network();
        assert_eq!(network.max_attempts, 5);
        assert_eq!(network.max_delay, Duration::from_secs(30));
        assert_eq!(RetryPolicy::blockchain().base_delay, Duration::from_secs(5));
        assert_eq!(RetryPolicy::file_io().max_delay, Duration::from_secs(10));
        assert_eq!(RetryPolicy::quick().base_delay, Duration::from_millis(500));
        assert!([RetryPolicy::quick(), RetryPolicy::file_io()]
            .iter()
            .all(|p| p.jitter && p.multiplier == 2.0));
    }

    #[tokio::test]
    async fn test_k_failures_then_success_sleeps_k_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = fast_policy(5)
            .run("flaky", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(AuditError::TransientNetwork("timeout".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.delays.len(), 3);
        assert_eq!(outcome.into_result().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error_without_extra_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = fast_policy(3)
            .run("always failing", || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AuditError::TransientNetwork(format!("attempt {}", n + 1)))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.delays.len(), 2);
        assert_eq!(
            outcome.into_result().unwrap_err(),
            AuditError::TransientNetwork("attempt 3".to_string())
        );
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), AuditError> = retry(
            &fast_policy(5),
            "rejected",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AuditError::PermanentProtocol("bad instruction".to_string()))
                }
            },
            AuditError::is_transient,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AuditError::PermanentProtocol(_))));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let outcome = fast_policy(0)
            .run("once", || async { Err::<(), _>("boom") })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.delays.is_empty());
    }
}
