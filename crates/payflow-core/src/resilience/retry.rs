//! Retry with exponential backoff, symmetric jitter, and a domain-driven
//! retryability filter.
//!
//! Randomness comes in through [`JitterSource`] so backoff schedules are
//! deterministic under test.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the computed delay, before jitter.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Jitter amplitude as a fraction of the delay (0.0 = none, 0.5 = ±50%).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    /// Config with the given retry budget and defaults elsewhere.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter amplitude, clamped to [0, 1].
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `attempt` (0-indexed):
    /// `min(initial * multiplier^attempt, max) ± delay * jitter * U(0,1)`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let offset = capped * self.jitter_factor * (2.0 * jitter.sample() - 1.0);
        Duration::from_secs_f64((capped + offset).max(0.0))
    }
}

/// Uniform random source for jitter. Injected so tests are deterministic.
pub trait JitterSource: Send + Sync {
    /// A sample from U(0, 1).
    fn sample(&self) -> f64;
}

/// Production jitter backed by the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Fixed jitter for deterministic tests. `FixedJitter(0.5)` means no offset.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Error returned when retries are exhausted or cut short.
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last error encountered.
    pub last_error: E,
    /// Total attempts made (initial attempt included).
    pub attempts: u32,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gave up after {} attempts ({:?}): {}",
            self.attempts, self.elapsed, self.last_error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// Executes async operations with bounded, classified retries.
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    jitter: Arc<dyn JitterSource>,
}

impl RetryExecutor {
    /// Executor with production jitter.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            jitter: Arc::new(ThreadRngJitter),
        }
    }

    /// Executor with an injected jitter source.
    pub fn with_jitter(config: RetryConfig, jitter: Arc<dyn JitterSource>) -> Self {
        Self { config, jitter }
    }

    /// The configuration in effect.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` at most `max_retries + 1` times.
    ///
    /// `is_retryable` short-circuits the loop: a non-retryable error is
    /// returned immediately with no backoff sleep.
    pub async fn execute<F, Fut, T, E>(
        &self,
        name: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !is_retryable(&error) || attempts > self.config.max_retries {
                        return Err(RetryError {
                            last_error: error,
                            attempts,
                            elapsed: start.elapsed(),
                        });
                    }

                    let delay = self
                        .config
                        .delay_for_attempt(attempts - 1, self.jitter.as_ref());
                    tracing::debug!(
                        operation = name,
                        attempt = attempts,
                        next_retry_in = ?delay,
                        error = %error,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter_factor(0.0)
    }

    #[test]
    fn test_delay_grows_exponentially_without_jitter() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_secs(1))
            .with_jitter_factor(0.0);
        let jitter = FixedJitter(0.5);

        assert_eq!(config.delay_for_attempt(0, &jitter), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1, &jitter), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2, &jitter), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter_factor(0.0);
        let jitter = FixedJitter(0.5);

        assert_eq!(config.delay_for_attempt(6, &jitter), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_is_symmetric() {
        let config = RetryConfig::new(1)
            .with_initial_delay(Duration::from_secs(1))
            .with_jitter_factor(0.5);

        // sample = 1.0 -> +50%; sample = 0.0 -> -50%; sample = 0.5 -> none.
        assert_eq!(
            config.delay_for_attempt(0, &FixedJitter(1.0)),
            Duration::from_secs_f64(1.5)
        );
        assert_eq!(
            config.delay_for_attempt(0, &FixedJitter(0.0)),
            Duration::from_secs_f64(0.5)
        );
        assert_eq!(
            config.delay_for_attempt(0, &FixedJitter(0.5)),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_success_needs_no_retry() {
        let executor = RetryExecutor::new(fast_config(3));
        let result = executor
            .execute(
                "op",
                || async { Ok::<_, std::io::Error>(7) },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_eventual_success_counts_attempts() {
        let executor = RetryExecutor::new(fast_config(3));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .execute(
                "op",
                || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"))
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let executor = RetryExecutor::new(fast_config(2));
        let result: Result<(), _> = executor
            .execute(
                "op",
                || async {
                    Err::<(), _>(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"))
                },
                |_| true,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let executor = RetryExecutor::new(fast_config(5));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = executor
            .execute(
                "op",
                || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "declined",
                        ))
                    }
                },
                |e: &std::io::Error| e.kind() == std::io::ErrorKind::TimedOut,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
