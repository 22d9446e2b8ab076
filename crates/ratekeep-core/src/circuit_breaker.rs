//! Circuit breaker guarding calls to the remote rate source.
//!
//! The breaker is `Closed` until `failure_threshold` consecutive failures,
//! then `Open` for `open_duration`. The first call after that window moves it
//! to `HalfOpen` and becomes the single trial; concurrent callers are rejected
//! until the trial reports. There is no background timer: transitions happen
//! lazily on the calling task.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::RateError;

/// Runtime circuit state for the protected resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    /// Upper bound on each guarded call; elapsing counts as a failure.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Point-in-time view of a breaker, for inspection and CLI output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Time until an `Open` breaker admits a trial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub trial_in_flight: bool,
}

/// Thread-safe circuit breaker, shared between resolutions through `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("remote", CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `call` under the breaker.
    ///
    /// Returns [`RateError::CircuitOpen`] without polling `call` when the
    /// breaker rejects it. A call that exceeds `call_timeout` fails with a
    /// transient error and counts against the breaker.
    pub async fn call<T, Fut>(&self, call: Fut) -> Result<T, RateError>
    where
        Fut: Future<Output = Result<T, RateError>>,
    {
        let mut permit = self.try_acquire()?;

        let outcome = match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RateError::transient(format!(
                "call timed out after {}ms",
                self.config.call_timeout.as_millis()
            ))),
        };

        match &outcome {
            Ok(_) => permit.success(),
            Err(error) => permit.failure(error),
        }
        outcome
    }

    /// Ask for admission. The returned permit must report an outcome; dropping
    /// it unreported releases a half-open trial slot without a transition.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, RateError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!(breaker = %self.name, "half-open trial already in flight, rejecting");
                    Err(RateError::circuit_open(&self.name))
                } else {
                    inner.trial_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
            CircuitState::Open => {
                let window_elapsed = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);

                if window_elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "circuit transitioned open -> half_open");
                    Ok(CallPermit::new(self, true))
                } else {
                    debug!(breaker = %self.name, "circuit open, rejecting call");
                    Err(RateError::circuit_open(&self.name))
                }
            }
        }
    }

    /// Current state, without applying the lazy open -> half-open move.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time left before an `Open` breaker admits a trial; `None` otherwise.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        self.remaining_open(&inner)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let retry_after_ms = self
            .remaining_open(&inner)
            .map(|remaining| u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX));

        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            retry_after_ms,
            trial_in_flight: inner.trial_in_flight,
        }
    }

    fn remaining_open(&self, inner: &CircuitInner) -> Option<Duration> {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(self.config.open_duration.saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        }
    }

    /// Force the breaker back to `Closed` with a cleared counter.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = CircuitInner::default();
        info!(breaker = %self.name, "circuit manually reset to closed");
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            info!(breaker = %self.name, "half-open trial succeeded, circuit closed");
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, trial: bool, error: &RateError) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            warn!(breaker = %self.name, %error, "half-open trial failed, circuit reopened");
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        debug!(
            breaker = %self.name,
            failures = inner.consecutive_failures,
            threshold = self.config.failure_threshold,
            %error,
            "guarded call failed"
        );
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "circuit transitioned closed -> open"
            );
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.trial_in_flight {
            inner.trial_in_flight = false;
            debug!(breaker = %self.name, "half-open trial abandoned, gate released");
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(breaker = %self.name, "circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Admission to make one guarded call.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    reported: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            reported: false,
        }
    }

    /// Whether this call is the half-open trial.
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(&mut self) {
        self.reported = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(&mut self, error: &RateError) {
        self.reported = true;
        self.breaker.record_failure(self.trial, error);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.reported {
            self.breaker.release_trial();
        }
    }
}
