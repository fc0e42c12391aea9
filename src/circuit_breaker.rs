// Circuit breaker state machine
// Closed -> Open after `threshold` consecutive failures; Open -> HalfOpen once `timeout`
// has passed since the last failure (checked lazily on the next call); HalfOpen admits a
// single trial call whose outcome closes or reopens the circuit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::RecoveryConfiguration;
use crate::error::{CircuitBreakerError, CircuitOpenError};
use crate::logging::utils::log_circuit_transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a breaker, for logs and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_last_failure_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub trial_in_flight: bool,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    threshold: u32,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, threshold: u32, timeout: Duration) -> Self {
        Self::with_clock(key, threshold, timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        key: impl Into<String>,
        threshold: u32,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key: key.into(),
            threshold: threshold.max(1),
            timeout,
            clock,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn from_config(
        key: impl Into<String>,
        config: &RecoveryConfiguration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_clock(
            key,
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout,
            clock,
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current state. An open breaker whose timeout has elapsed reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        self.effective_state(&inner, self.clock.now())
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        let now = self.clock.now();
        let state = self.effective_state(&inner, now);
        let since_last_failure = inner.last_failure.map(|at| now.saturating_duration_since(at));
        let retry_after = match state {
            CircuitState::Open => since_last_failure.map(|since| self.timeout.saturating_sub(since)),
            _ => None,
        };

        CircuitBreakerSnapshot {
            key: self.key.clone(),
            state,
            failure_count: inner.failure_count,
            threshold: self.threshold,
            timeout_ms: millis(self.timeout),
            since_last_failure_ms: since_last_failure.map(millis),
            retry_after_ms: retry_after.map(millis),
            trial_in_flight: inner.trial_in_flight,
        }
    }

    /// Force the breaker back to `Closed` with a zero count
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        *inner = BreakerState::new();
        if previous != CircuitState::Closed {
            log_circuit_transition(&self.key, previous, CircuitState::Closed, 0);
        }
    }

    /// Run `f` through the breaker; every `Err` counts as a failure
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_if(f, |_| true).await
    }

    /// Run `f` through the breaker; only errors for which `is_failure` returns true
    /// move the failure count. Other errors leave the state untouched and release
    /// a half-open trial slot.
    pub async fn call_if<T, E, F, Fut, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let admission = self.try_acquire().map_err(CircuitBreakerError::Open)?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let outcome = f().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(error) => {
                if is_failure(&error) {
                    self.record_failure(admission);
                } else if admission == Admission::Trial {
                    self.release_trial();
                }
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    fn effective_state(&self, inner: &BreakerState, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Open if self.timeout_elapsed(inner, now) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn timeout_elapsed(&self, inner: &BreakerState, now: Instant) -> bool {
        inner
            .last_failure
            .map_or(true, |at| now.saturating_duration_since(at) >= self.timeout)
    }

    /// Check-then-claim in one critical section
    fn try_acquire(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();

        if inner.state == CircuitState::Open {
            if !self.timeout_elapsed(&inner, now) {
                let since = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                return Err(self.open_error(self.timeout.saturating_sub(since)));
            }
            inner.state = CircuitState::HalfOpen;
            log_circuit_transition(
                &self.key,
                CircuitState::Open,
                CircuitState::HalfOpen,
                inner.failure_count,
            );
        }

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if inner.trial_in_flight => Err(self.open_error(Duration::ZERO)),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::Open => Err(self.open_error(self.timeout)),
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission == Admission::Trial {
            inner.trial_in_flight = false;
        }
        let previous = inner.state;
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
        if previous != CircuitState::Closed {
            log_circuit_transition(&self.key, previous, CircuitState::Closed, 0);
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission == Admission::Trial {
            inner.trial_in_flight = false;
        }
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(self.clock.now());

        let previous = inner.state;
        let reopen = previous == CircuitState::HalfOpen;
        let trip = previous == CircuitState::Closed && inner.failure_count >= self.threshold;
        if reopen || trip {
            inner.state = CircuitState::Open;
            log_circuit_transition(
                &self.key,
                previous,
                CircuitState::Open,
                inner.failure_count,
            );
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            key: self.key.clone(),
            retry_after,
        }
    }
}

/// Frees the half-open trial slot if the call future is dropped mid-flight
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
