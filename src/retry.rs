//! Backoff retrier for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts; `0` is treated as `1` (a single try, no retry).
//! - The delay between attempts is constant.
//! - The `should_retry` predicate classifies a failure; a non-retryable failure is returned
//!   at once without consuming the remaining attempts.
//! - When attempts run out, the last failure is returned.
//!
//! Invariants:
//! - Attempts never exceed `max_attempts` and are strictly sequential.
//! - The sleeper is invoked exactly `attempts - 1` times when every attempt fails.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use lifeguard::{InstantSleeper, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<std::io::Error>::builder()
//!     .max_attempts(3)
//!     .delay(Duration::from_millis(100))
//!     .with_sleeper(InstantSleeper)
//!     .build();
//! let result: Result<u32, std::io::Error> = policy.execute(|| async { Ok(7) }).await;
//! assert_eq!(result.unwrap(), 7);
//! # });
//! ```

use crate::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The operation produced a value.
    Success,
    /// The operation failed in a way worth retrying.
    TransientFailure,
    /// The operation failed in a way that ends the call.
    FatalFailure,
}

/// Record of one attempt within a logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallAttempt {
    /// 1-indexed attempt number.
    pub attempt_number: u32,
    /// When the attempt began.
    pub started_at: Instant,
    /// How it ended.
    pub outcome: AttemptOutcome,
}

/// Retry policy combining attempt budget, constant delay, predicate, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: u32,
    delay: Duration,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::fmt::Display + Send + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Total attempts this policy will make.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause between attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, E>
    where
        T: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_recorded(operation).await.0
    }

    /// Execute and also return the record of every attempt made.
    pub async fn execute_recorded<T, Fut, Op>(
        &self,
        mut operation: Op,
    ) -> (Result<T, E>, Vec<CallAttempt>)
    where
        T: Send,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut attempts = Vec::with_capacity(self.max_attempts as usize);
        let mut attempt_number = 0;

        loop {
            attempt_number += 1;
            let started_at = Instant::now();
            match operation().await {
                Ok(value) => {
                    attempts.push(CallAttempt {
                        attempt_number,
                        started_at,
                        outcome: AttemptOutcome::Success,
                    });
                    return (Ok(value), attempts);
                }
                Err(e) => {
                    if !(self.should_retry)(&e) {
                        attempts.push(CallAttempt {
                            attempt_number,
                            started_at,
                            outcome: AttemptOutcome::FatalFailure,
                        });
                        tracing::debug!(
                            target: "lifeguard::retry",
                            attempt = attempt_number,
                            error = %e,
                            "non-retryable failure"
                        );
                        return (Err(e), attempts);
                    }

                    attempts.push(CallAttempt {
                        attempt_number,
                        started_at,
                        outcome: AttemptOutcome::TransientFailure,
                    });
                    tracing::warn!(
                        target: "lifeguard::retry",
                        attempt = attempt_number,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "retrier failed attempt"
                    );

                    if attempt_number >= self.max_attempts {
                        return (Err(e), attempts);
                    }

                    self.sleeper.sleep(self.delay).await;
                }
            }
        }
    }
}

/// Convenience form of [`RetryPolicy`]: retry every failure with a constant delay on the
/// tokio timer.
pub async fn run_with_retries<T, E, Fut, Op>(
    operation: Op,
    max_attempts: u32,
    delay: Duration,
) -> Result<T, E>
where
    T: Send,
    E: std::fmt::Display + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
    Op: FnMut() -> Fut + Send,
{
    RetryPolicy::builder().max_attempts(max_attempts).delay(delay).build().execute(operation).await
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: u32,
    delay: Duration,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::fmt::Display + Send + 'static,
{
    /// Create a builder with defaults: 3 attempts, 100 ms apart, every failure retryable.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            delay: DEFAULT_RETRY_DELAY,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts. Zero means a single attempt.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the constant pause between attempts.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Predicate deciding whether a failure is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Provide an already shared sleeper.
    pub fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Build the retry policy.
    pub fn build(self) -> RetryPolicy<E> {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            delay: self.delay,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        }
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::fmt::Display + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
