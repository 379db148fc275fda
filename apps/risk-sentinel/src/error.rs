//! Crate-level error.

use thiserror::Error;

use crate::broker::{BrokerError, RateLimitError};
use crate::config::ConfigError;
use crate::enforcement::EnforcementError;
use crate::monitor::MonitorError;
use crate::observability::ObservabilityError;
use crate::policy::PolicyError;
use crate::resilience::CircuitBreakerError;
use crate::safety::{IdempotencyError, LockoutError};

/// Any error surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Policy table.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Broker call.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Local rate limiter.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// Circuit breaker.
    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),

    /// Lockout store.
    #[error(transparent)]
    Lockout(#[from] LockoutError),

    /// Idempotency table.
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    /// Enforcement step.
    #[error(transparent)]
    Enforcement(#[from] EnforcementError),

    /// Tick scheduler.
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// Logging or metrics setup.
    #[error(transparent)]
    Observability(#[from] ObservabilityError),
}

/// Library result.
pub type Result<T, E = Error> = std::result::Result<T, E>;
