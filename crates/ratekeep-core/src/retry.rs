//! Retry logic with exponential backoff and jitter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::alert::{FailureEvent, Publisher};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{RateError, RetryClass};

/// Backoff strategy for retrying failed requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Uses an exponential delay between retries.
    ///
    /// The delay is calculated as `base * (factor ^ retry)`.
    Exponential {
        /// The initial backoff duration.
        base: Duration,
        /// The multiplicative factor for each subsequent retry.
        factor: f64,
        /// The maximum duration to wait between retries.
        max: Duration,
        /// Whether to apply random jitter (+/- 50%) to the delay.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Calculate the delay for a given retry (0-based: the first retry is 0).
    pub fn delay(self, retry: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped_seconds = if seconds.is_finite() {
                    seconds.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };

                let mut delay = Duration::from_secs_f64(capped_seconds.max(0.0));

                if jitter {
                    let jitter_ms = (delay.as_millis() as f64 * 0.5) as u64;
                    let random_offset = fastrand::u64(0..=(jitter_ms * 2));
                    let total_ms =
                        delay.as_millis() as i64 + (random_offset as i64 - jitter_ms as i64);
                    delay = Duration::from_millis(total_ms.max(0) as u64);
                }

                delay
            }
        }
    }
}

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// The backoff strategy to use between attempts.
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff doubling from `base`, capped at 30 seconds.
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                factor: 2.0,
                max: Duration::from_secs(30),
                jitter: false,
            },
        }
    }

    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay that precedes `attempt` (1-based). The first attempt never waits.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.backoff.delay(attempt - 2)
        }
    }
}

/// One attempt inside a single retry sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    /// 1-based.
    pub attempt_number: u32,
    pub delay_before_attempt: Duration,
    /// Failure of the previous attempt that caused this one.
    pub cause: Option<RateError>,
}

/// Bounded retries around a remote call, publishing one [`FailureEvent`]
/// when the budget runs out.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    source_id: String,
    target: String,
    publisher: Option<Arc<dyn Publisher>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RetryPolicy {
    /// `target` names what is being fetched in exhaustion messages.
    pub fn new(config: RetryConfig, source_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            config,
            source_id: source_id.into(),
            target: target.into(),
            publisher: None,
            breaker: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Give up before a backoff sleep that would end while `breaker` is
    /// still open.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails terminally, is rejected by an
    /// open circuit, or the attempt budget is spent.
    ///
    /// Errors:
    /// - [`RateError::CircuitOpen`] passes through untouched.
    /// - Terminal failures and exhaustion become
    ///   [`RateError::RemoteUnavailable`]; only exhaustion publishes an alert.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, RateError>
    where
        F: FnMut(RetryAttempt) -> Fut,
        Fut: Future<Output = Result<T, RateError>>,
    {
        let max_attempts = self.config.attempts();
        let mut cause: Option<RateError> = None;

        for attempt_number in 1..=max_attempts {
            let delay_before_attempt = self.config.delay_before_attempt(attempt_number);
            if !delay_before_attempt.is_zero() {
                if let Some(breaker) = &self.breaker {
                    if breaker.retry_after().is_some_and(|remaining| remaining > delay_before_attempt) {
                        warn!(source = %self.source_id, attempt = attempt_number, "circuit open, abandoning retries");
                        return Err(RateError::circuit_open(breaker.name()));
                    }
                }
                tokio::time::sleep(delay_before_attempt).await;
            }

            let attempt = RetryAttempt {
                attempt_number,
                delay_before_attempt,
                cause: cause.take(),
            };

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt_number > 1 {
                        info!(source = %self.source_id, attempt = attempt_number, "remote call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            match error.retry_class() {
                RetryClass::CircuitOpen => {
                    warn!(source = %self.source_id, attempt = attempt_number, "circuit open, abandoning retries");
                    return Err(error);
                }
                RetryClass::Never => {
                    warn!(source = %self.source_id, attempt = attempt_number, %error, "terminal remote failure, not retrying");
                    return Err(RateError::RemoteUnavailable {
                        source_id: self.source_id.clone(),
                        attempts: attempt_number,
                        message: error.to_string(),
                    });
                }
                RetryClass::Retry => {
                    warn!(
                        source = %self.source_id,
                        attempt = attempt_number,
                        max_attempts,
                        %error,
                        "remote attempt failed"
                    );
                    cause = Some(error);
                }
            }
        }

        let last = cause
            .map(|error| error.to_string())
            .unwrap_or_else(|| String::from("no attempt was made"));
        Err(self.exhausted(max_attempts, last))
    }

    fn exhausted(&self, attempts: u32, cause: String) -> RateError {
        let summary = format!("Failed to fetch {} after {attempts} attempts", self.target);
        error!(source = %self.source_id, attempts, cause = %cause, "{summary}");

        if let Some(publisher) = &self.publisher {
            let event = FailureEvent {
                error_message: format!("{summary}: {cause}"),
                source_identifier: self.source_id.clone(),
                attempts,
                timestamp: OffsetDateTime::now_utc(),
            };
            if let Err(publish_error) = publisher.publish(event) {
                warn!(source = %self.source_id, error = %publish_error, "failed to publish retry-exhausted alert");
            }
        }

        RateError::RemoteUnavailable {
            source_id: self.source_id.clone(),
            attempts,
            message: cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlertError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<FailureEvent>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, event: FailureEvent) -> Result<(), AlertError> {
            self.events.lock().expect("lock").push(event);
            Ok(())
        }
    }

    struct BrokenPublisher;

    impl Publisher for BrokenPublisher {
        fn publish(&self, _event: FailureEvent) -> Result<(), AlertError> {
            Err(AlertError::ChannelUnavailable(String::from("closed")))
        }
    }

    fn policy(publisher: Arc<dyn Publisher>) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::exponential(3, Duration::from_secs(1)),
            "rate-api",
            "RateValue",
        )
        .with_publisher(publisher)
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(100),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff_with_jitter() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        };

        for _ in 0..10 {
            for retry in 0..5 {
                let delay_ms = backoff.delay(retry).as_millis() as f64;
                let expected = (100.0 * 2_f64.powi(retry as i32)).min(1000.0);
                assert!(delay_ms >= expected * 0.49, "retry={retry}, delay_ms={delay_ms}");
                assert!(delay_ms <= expected * 1.51, "retry={retry}, delay_ms={delay_ms}");
            }
        }
    }

    #[test]
    fn test_delay_before_attempt_skips_first() {
        let config = RetryConfig::exponential(3, Duration::from_secs(1));

        assert_eq!(config.delay_before_attempt(1), Duration::ZERO);
        assert_eq!(config.delay_before_attempt(2), Duration::from_secs(1));
        assert_eq!(config.delay_before_attempt(3), Duration::from_secs(2));
        assert_eq!(RetryConfig::no_retry().attempts(), 1);
        assert_eq!(RetryConfig { max_attempts: 0, ..RetryConfig::default() }.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_before_budget_is_spent() {
        let publisher = Arc::new(RecordingPublisher::default());
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = policy(publisher.clone())
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt.attempt_number < 3 {
                        Err(RateError::transient("503"))
                    } else {
                        assert_eq!(attempt.cause, Some(RateError::transient("503")));
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(value, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(publisher.events.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_publishes_once() {
        let publisher = Arc::new(RecordingPublisher::default());

        let outcome = policy(publisher.clone())
            .execute(|_| async { Err::<(), _>(RateError::transient("connection reset")) })
            .await;

        assert_eq!(
            outcome,
            Err(RateError::RemoteUnavailable {
                source_id: String::from("rate-api"),
                attempts: 3,
                message: String::from("transient remote error: connection reset"),
            })
        );

        let events = publisher.events.lock().expect("lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].attempts, 3);
        assert_eq!(
            events[0].error_message,
            "Failed to fetch RateValue after 3 attempts: transient remote error: connection reset"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_and_open_circuit_stop_immediately() {
        let publisher = Arc::new(RecordingPublisher::default());
        let calls = AtomicU32::new(0);

        let terminal = policy(publisher.clone())
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RateError::terminal("malformed body")) }
            })
            .await;
        assert!(matches!(terminal, Err(RateError::RemoteUnavailable { attempts: 1, .. })));

        let open = policy(publisher.clone())
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(RateError::circuit_open("rate-api")) }
            })
            .await;
        assert_eq!(open, Err(RateError::circuit_open("rate-api")));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(publisher.events.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_does_not_mask_unavailability() {
        let outcome = policy(Arc::new(BrokenPublisher))
            .execute(|_| async { Err::<(), _>(RateError::transient("timeout")) })
            .await;

        assert!(matches!(outcome, Err(RateError::RemoteUnavailable { attempts: 3, .. })));
    }

    fn tripping_breaker(open_duration: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "rate-api",
            crate::circuit_breaker::CircuitBreakerConfig {
                failure_threshold: 1,
                open_duration,
                ..Default::default()
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_backoff_sleep() {
        let breaker = tripping_breaker(Duration::from_secs(30));
        let publisher = Arc::new(RecordingPublisher::default());
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let outcome = policy(publisher.clone())
            .with_breaker(breaker.clone())
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                breaker.call(async { Err::<(), _>(RateError::transient("503")) })
            })
            .await;

        assert_eq!(outcome, Err(RateError::circuit_open("rate-api")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(publisher.events.lock().expect("lock").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_that_outlasts_open_window_still_runs() {
        let breaker = tripping_breaker(Duration::from_millis(500));
        let calls = AtomicU32::new(0);

        let outcome = policy(Arc::new(RecordingPublisher::default()))
            .with_breaker(breaker.clone())
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                breaker.call(async move {
                    if attempt.attempt_number == 1 {
                        Err(RateError::transient("503"))
                    } else {
                        Ok(attempt.attempt_number)
                    }
                })
            })
            .await;

        assert_eq!(outcome, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
