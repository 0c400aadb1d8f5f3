//! Retry Policy and Executor
//!
//! Every remote operation a transport performs runs through
//! [`retry_with_policy`], which consults a [`RetryPolicy`] after each failed
//! attempt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  get_properties  │ TransportClient API
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────────────────┐
//! │  retry_with_policy           │──── cancel token checked before every
//! │  - try_timeout per attempt   │     attempt and raced against every
//! │  - should_retry on failure   │     attempt and back-off sleep
//! └────────┬─────────────────────┘
//!          │
//!          ├─→ Attempt 1: Immediate
//!          ├─→ Attempt 2: Wait 800ms  (delay)
//!          ├─→ Attempt 3: Wait 1.6s   (delay * 2)
//!          └─→ Attempt 4: Wait 3.2s   (delay * 4)
//! ```
//!
//! ## Retryable vs Non-Retryable Errors
//!
//! The policy retries exactly the errors [`ClientError::is_transient`] accepts
//! (`ServiceCommunication`, `ServiceTimeout`, `ServiceBusy`). Everything else is
//! returned to the caller on first occurrence. When the policy gives up on a
//! transient error, the executor returns [`ClientError::RetriesExhausted`] with
//! the attempt count, the elapsed time and the last error.
//!
//! ## Examples
//!
//! ```ignore
//! use busline_client::retry::{retry_with_policy, BasicRetryPolicy};
//!
//! let policy = BasicRetryPolicy::new(RetryOptions::default());
//! let props = retry_with_policy(&policy, &cancel, "get_properties", |_try_timeout| async {
//!     broker.entity_properties(&entity).await
//! })
//! .await?;
//! ```

use crate::error::{ClientError, Result};
use crate::options::{RetryMode, RetryOptions};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of asking a policy about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the operation again after this delay.
    Retry(Duration),
    GiveUp,
}

/// Decides whether and when a failed operation is attempted again.
///
/// Implementations must be stateless: one policy instance is shared by every
/// operation of a client and may be consulted concurrently.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Deadline for a single attempt. `attempt` is 1-based.
    fn try_timeout(&self, attempt: u32) -> Duration;

    /// `attempt` is the number of attempts that have failed so far (1-based);
    /// `elapsed` is measured from the start of the first attempt.
    fn should_retry(&self, attempt: u32, error: &ClientError, elapsed: Duration) -> RetryDecision;
}

/// [`RetryPolicy`] driven by [`RetryOptions`].
///
/// # Backoff Calculation
///
/// ```text
/// fixed:       delay
/// exponential: min(delay * 2^(attempt-1), max_delay)
///
/// jittered = min(base * (1 ± jitter), max_delay)
/// ```
///
/// The overall budget for one operation is `try_timeout * (max_retries + 1)`;
/// a retry whose delay would overrun it is not scheduled.
#[derive(Debug, Clone, Default)]
pub struct BasicRetryPolicy {
    options: RetryOptions,
}

impl BasicRetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// ```ignore
    /// let policy = BasicRetryPolicy::default();
    /// assert_eq!(policy.base_delay(1), Duration::from_millis(800));
    /// assert_eq!(policy.base_delay(2), Duration::from_millis(1600));
    /// ```
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let options = &self.options;
        match options.mode {
            RetryMode::Fixed => options.delay.min(options.max_delay),
            RetryMode::Exponential => {
                // 2^62 already dwarfs any sane cap
                let exponent = attempt.saturating_sub(1).min(62) as i32;
                let secs = options.delay.as_secs_f64() * 2f64.powi(exponent);
                let capped = secs.min(options.max_delay.as_secs_f64());
                Duration::from_secs_f64(capped)
            }
        }
    }

    /// Upper bound on the total time spent on one operation.
    pub fn operation_budget(&self) -> Duration {
        self.options
            .try_timeout
            .saturating_mul(self.options.max_retries.saturating_add(1))
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.options.jitter;
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        // factor in [1 - jitter, 1 + jitter]
        let factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * jitter;
        let secs = (base.as_secs_f64() * factor).max(0.0);
        Duration::from_secs_f64(secs).min(self.options.max_delay)
    }
}

impl RetryPolicy for BasicRetryPolicy {
    fn try_timeout(&self, _attempt: u32) -> Duration {
        self.options.try_timeout
    }

    fn should_retry(&self, attempt: u32, error: &ClientError, elapsed: Duration) -> RetryDecision {
        if !error.is_transient() || attempt > self.options.max_retries {
            return RetryDecision::GiveUp;
        }

        let delay = self.jittered(self.base_delay(attempt));
        if elapsed.saturating_add(delay) > self.operation_budget() {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry(delay)
    }
}

/// Run `operation` under `policy` until it succeeds, fails permanently, runs
/// out of retries, or `cancel` fires.
///
/// `operation` receives the try timeout of the current attempt so it can pass
/// it down to the transport.
///
/// # Behavior
///
/// 1. If `cancel` is already cancelled, return `OperationCanceled` without calling `operation`
/// 2. Run the attempt, bounded by the try timeout and raced against `cancel`
/// 3. On success return the result
/// 4. On failure ask the policy:
///    - `Retry(delay)`: sleep (raced against `cancel`) and go to 2
///    - `GiveUp` on a transient error: return `RetriesExhausted`
///    - `GiveUp` on anything else: return the error unchanged
pub async fn retry_with_policy<F, Fut, T>(
    policy: &dyn RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(ClientError::OperationCanceled);
    }

    let started = Instant::now();
    let mut failures: u32 = 0;

    loop {
        let try_timeout = policy.try_timeout(failures + 1);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::OperationCanceled),
            result = timeout(try_timeout, operation(try_timeout)) => match result {
                Ok(result) => result,
                Err(_) => Err(ClientError::ServiceTimeout(try_timeout)),
            },
        };

        let error = match outcome {
            Ok(value) => {
                if failures > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = failures + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(ClientError::OperationCanceled) => return Err(ClientError::OperationCanceled),
            Err(error) => error,
        };

        failures += 1;
        let elapsed = started.elapsed();

        match policy.should_retry(failures, &error, elapsed) {
            RetryDecision::GiveUp if error.is_transient() => {
                warn!(
                    operation = operation_name,
                    attempts = failures,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %error,
                    "Retries exhausted, giving up"
                );
                return Err(ClientError::RetriesExhausted {
                    attempts: failures,
                    elapsed,
                    source: Box::new(error),
                });
            }
            RetryDecision::GiveUp => {
                debug!(
                    operation = operation_name,
                    error = %error,
                    "Non-retryable error, giving up"
                );
                return Err(error);
            }
            RetryDecision::Retry(delay) => {
                warn!(
                    operation = operation_name,
                    attempt = failures,
                    backoff_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retryable error, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ClientError::OperationCanceled),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_options(max_retries: u32) -> RetryOptions {
        RetryOptions {
            mode: RetryMode::Exponential,
            max_retries,
            delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            try_timeout: Duration::from_secs(5),
            jitter: 0.0,
        }
    }

    // ========================================================================
    // BasicRetryPolicy - delay calculation
    // ========================================================================

    #[test]
    fn test_exponential_base_delay_default() {
        let policy = BasicRetryPolicy::default();

        assert_eq!(policy.base_delay(1), Duration::from_millis(800));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1600));
        assert_eq!(policy.base_delay(3), Duration::from_millis(3200));
        assert_eq!(policy.base_delay(4), Duration::from_millis(6400));
    }

    #[test]
    fn test_exponential_base_delay_capped() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..RetryOptions::default()
        });

        assert_eq!(policy.base_delay(4), Duration::from_secs(8));
        assert_eq!(policy.base_delay(5), Duration::from_secs(10)); // Capped
        assert_eq!(policy.base_delay(1000), Duration::from_secs(10)); // Still capped
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_base_delay_non_decreasing() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            delay: Duration::from_millis(3),
            max_delay: Duration::from_millis(700),
            ..RetryOptions::default()
        });

        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous, "attempt {} went down", attempt);
            assert!(delay <= Duration::from_millis(700));
            previous = delay;
        }
    }

    #[test]
    fn test_fixed_base_delay_is_constant() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            mode: RetryMode::Fixed,
            delay: Duration::from_millis(500),
            ..RetryOptions::default()
        });

        for attempt in 1..10 {
            assert_eq!(policy.base_delay(attempt), Duration::from_millis(500));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
            jitter: 0.5,
            ..RetryOptions::default()
        });

        for _ in 0..200 {
            match policy.should_retry(1, &ClientError::ServiceBusy("x".into()), Duration::ZERO) {
                RetryDecision::Retry(delay) => {
                    assert!(delay >= Duration::from_millis(50));
                    assert!(delay <= Duration::from_millis(150));
                }
                RetryDecision::GiveUp => panic!("expected a retry"),
            }
        }
    }

    // ========================================================================
    // BasicRetryPolicy - decisions
    // ========================================================================

    #[test]
    fn test_gives_up_past_max_retries() {
        let policy = BasicRetryPolicy::new(fast_options(3));
        let err = ClientError::ServiceCommunication("down".into());

        for attempt in 1..=3 {
            assert!(matches!(
                policy.should_retry(attempt, &err, Duration::ZERO),
                RetryDecision::Retry(_)
            ));
        }
        assert_eq!(
            policy.should_retry(4, &err, Duration::ZERO),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_zero_retries_never_retries() {
        let policy = BasicRetryPolicy::new(fast_options(0));
        assert_eq!(
            policy.should_retry(1, &ClientError::ServiceBusy("x".into()), Duration::ZERO),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_gives_up_on_non_transient() {
        let policy = BasicRetryPolicy::new(fast_options(5));
        for err in [
            ClientError::Authorization("denied".into()),
            ClientError::EntityNotFound("q".into()),
            ClientError::ClientClosed("client".into()),
            ClientError::OperationCanceled,
        ] {
            assert_eq!(
                policy.should_retry(1, &err, Duration::ZERO),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn test_gives_up_when_budget_spent() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            try_timeout: Duration::from_secs(1),
            ..fast_options(3)
        });
        assert_eq!(policy.operation_budget(), Duration::from_secs(4));

        let err = ClientError::ServiceTimeout(Duration::from_secs(1));
        assert_eq!(
            policy.should_retry(1, &err, Duration::from_secs(4)),
            RetryDecision::GiveUp
        );
        assert!(matches!(
            policy.should_retry(1, &err, Duration::from_secs(2)),
            RetryDecision::Retry(_)
        ));
    }

    // ========================================================================
    // retry_with_policy
    // ========================================================================

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let policy = BasicRetryPolicy::new(fast_options(3));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_policy(&policy, &cancel, "test", |_| {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ClientError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = BasicRetryPolicy::new(fast_options(3));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_policy(&policy, &cancel, "test", |_| {
            let a = attempts_clone.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ClientError::ServiceBusy("throttled".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_wraps_last_error() {
        let policy = BasicRetryPolicy::new(fast_options(2));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<()> = retry_with_policy(&policy, &cancel, "test", |_| {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::ServiceCommunication("unreachable".into()))
            }
        })
        .await;

        // 1 initial + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            ClientError::RetriesExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ClientError::ServiceCommunication(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let policy = BasicRetryPolicy::new(fast_options(5));
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<()> = retry_with_policy(&policy, &cancel, "test", |_| {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Authorization("bad key".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ClientError::Authorization(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_never_calls_operation() {
        let policy = BasicRetryPolicy::new(fast_options(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_policy(&policy, &cancel, "test", |_| {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(ClientError::OperationCanceled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retrying() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            mode: RetryMode::Fixed,
            max_retries: 10,
            delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            try_timeout: Duration::from_secs(60),
            jitter: 0.0,
        });
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = retry_with_policy(&policy, &cancel, "test", |_| {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::ServiceBusy("throttled".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ClientError::OperationCanceled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out_and_is_retried() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            try_timeout: Duration::from_millis(50),
            ..fast_options(2)
        });
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_policy(&policy, &cancel, "test", |_| {
            let a = attempts_clone.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    sleep(Duration::from_secs(10)).await;
                }
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_operation_receives_try_timeout() {
        let policy = BasicRetryPolicy::new(RetryOptions {
            try_timeout: Duration::from_millis(1234),
            ..fast_options(0)
        });
        let cancel = CancellationToken::new();

        let seen = retry_with_policy(&policy, &cancel, "test", |try_timeout| async move {
            Ok(try_timeout)
        })
        .await
        .unwrap();

        assert_eq!(seen, Duration::from_millis(1234));
    }
}
