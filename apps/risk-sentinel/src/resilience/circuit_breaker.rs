//! Consecutive-failure circuit breaker.
//!
//! One breaker guards one logical broker endpoint and wraps the whole retry
//! sequence for a call, so a retried-then-exhausted call counts once.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN       (failure_threshold failures within failure_window)
//! OPEN → HALF_OPEN    (recovery_timeout elapsed; exactly one trial call admitted)
//! HALF_OPEN → CLOSED  (trial call succeeds; failure count reset)
//! HALF_OPEN → OPEN    (trial call fails; recovery timer restarted)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::observability;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without touching the endpoint.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Rejection from [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Breaker is open.
    #[error("circuit {name} is open, retry in {retry_in:?}")]
    Open {
        /// Endpoint name.
        name: String,
        /// Time until a trial call will be admitted.
        retry_in: Duration,
    },

    /// Breaker is half-open and its single trial call is already in flight.
    #[error("circuit {name} is half-open with a trial call in flight")]
    TrialInFlight {
        /// Endpoint name.
        name: String,
    },
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call.
    pub recovery_timeout: Duration,
    /// Failures older than this no longer count towards the threshold.
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Endpoint name.
    pub name: String,
    /// Current state.
    pub state: CircuitBreakerState,
    /// Failures counted towards the threshold.
    pub failure_count: u32,
    /// Calls admitted.
    pub total_calls: u64,
    /// Calls that failed.
    pub total_failures: u64,
    /// Calls rejected without touching the endpoint.
    pub rejected_calls: u64,
    /// State transitions.
    pub state_transitions: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for a single endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    /// Endpoint name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose recovery timeout has elapsed
    /// still reports `OPEN` until a call is attempted.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Ask to make a call. On `Ok` the caller must report the outcome with
    /// [`record_success`](Self::record_success), [`record_failure`](Self::record_failure)
    /// or [`release`](Self::release).
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitBreakerState::Closed => {}
            CircuitBreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                if elapsed < self.config.recovery_timeout {
                    drop(inner);
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_in: self.config.recovery_timeout - elapsed,
                    });
                }
                self.transition(&mut inner, CircuitBreakerState::HalfOpen);
                inner.trial_in_flight = true;
            }
            CircuitBreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    return Err(CircuitBreakerError::TrialInFlight {
                        name: self.name.clone(),
                    });
                }
                inner.trial_in_flight = true;
            }
        }
        drop(inner);
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        if inner.state == CircuitBreakerState::HalfOpen {
            self.transition(&mut inner, CircuitBreakerState::Closed);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;

        let state = inner.state;
        match state {
            CircuitBreakerState::Closed => {
                if inner
                    .last_failure
                    .is_some_and(|t| now.duration_since(t) > self.config.failure_window)
                {
                    inner.failure_count = 0;
                }
                inner.failure_count += 1;
                inner.last_failure = Some(now);

                if inner.failure_count >= self.config.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen => {
                inner.last_failure = Some(now);
                inner.opened_at = Some(now);
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            CircuitBreakerState::Open => {
                tracing::warn!(name = %self.name, "Call recorded while circuit is OPEN");
            }
        }
    }

    /// Give back an admitted call that never reached the endpoint.
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    /// Force the circuit open (manual intervention).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitBreakerState::Open);
    }

    /// Force the circuit closed and clear the failure count.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitBreakerState::Closed);
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitBreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
        observability::record_circuit_breaker_state(&self.name, to);

        match to {
            CircuitBreakerState::Open => tracing::warn!(
                name = %self.name,
                from = %from,
                to = "OPEN",
                failures = inner.failure_count,
                "Circuit breaker opened"
            ),
            CircuitBreakerState::HalfOpen => tracing::info!(
                name = %self.name,
                from = %from,
                to = "HALF_OPEN",
                "Circuit breaker testing"
            ),
            CircuitBreakerState::Closed => tracing::info!(
                name = %self.name,
                from = %from,
                to = "CLOSED",
                "Circuit breaker closed"
            ),
        }
    }
}
