//! Broker error taxonomy.

use std::time::Duration;

use super::{BucketKind, RateLimitError};

/// Retry class of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// 401: refresh credentials once and retry.
    Auth,
    /// 429: back off and retry with a higher ceiling.
    RateLimit,
    /// 5xx: moderate backoff.
    Server,
    /// Network or timeout.
    Transient,
    /// Everything else; never retried.
    Fatal,
}

/// Broker call error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Credentials rejected (HTTP 401).
    #[error("Unauthorized: {message}")]
    Unauthorized {
        /// Error details.
        message: String,
    },

    /// Upstream rate limit hit (HTTP 429).
    #[error("Rate limited by broker")]
    RateLimited {
        /// Server-provided wait, if any.
        retry_after: Option<Duration>,
    },

    /// Server error (HTTP 5xx).
    #[error("Server error {status}: {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Error details.
        message: String,
    },

    /// Client error (4xx other than 401/429).
    #[error("Request rejected with {status}: {message}")]
    Client {
        /// HTTP status.
        status: u16,
        /// Error details.
        message: String,
    },

    /// Connection failure.
    #[error("Broker connection error: {message}")]
    Network {
        /// Error details.
        message: String,
    },

    /// Connect or read timeout.
    #[error("Broker request timed out: {message}")]
    Timeout {
        /// Error details.
        message: String,
    },

    /// Broker accepted the request but refused it.
    #[error("Order rejected: {reason}")]
    Rejected {
        /// Rejection reason.
        reason: String,
    },

    /// Response payload could not be mapped.
    #[error("Unexpected broker payload: {message}")]
    Decode {
        /// Error details.
        message: String,
    },

    /// Local rate limiter had no tokens in time. Not an API failure: the call
    /// was never made.
    #[error("Local rate limit: no {bucket} tokens available")]
    Throttled {
        /// Bucket that ran dry.
        bucket: BucketKind,
    },

    /// Endpoint circuit is open. The call was never made.
    #[error("Circuit open for {endpoint}")]
    CircuitOpen {
        /// Endpoint name.
        endpoint: String,
    },
}

impl BrokerError {
    /// Retry class for this error.
    #[must_use]
    pub const fn failure_class(&self) -> FailureClass {
        match self {
            Self::Unauthorized { .. } => FailureClass::Auth,
            Self::RateLimited { .. } => FailureClass::RateLimit,
            Self::Server { .. } => FailureClass::Server,
            Self::Network { .. } | Self::Timeout { .. } => FailureClass::Transient,
            Self::Client { .. }
            | Self::Rejected { .. }
            | Self::Decode { .. }
            | Self::Throttled { .. }
            | Self::CircuitOpen { .. } => FailureClass::Fatal,
        }
    }

    /// "Do not call the API now": the request never left the process and the
    /// caller should try again next tick.
    #[must_use]
    pub const fn is_not_now(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::CircuitOpen { .. })
    }

    /// Whether the error indicates an unhealthy endpoint.
    #[must_use]
    pub const fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. }
                | Self::RateLimited { .. }
                | Self::Server { .. }
                | Self::Network { .. }
                | Self::Timeout { .. }
        )
    }

    /// Map an HTTP status to an error.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => Self::Unauthorized { message },
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::Server { status, message },
            _ => Self::Client { status, message },
        }
    }
}

impl From<RateLimitError> for BrokerError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Timeout { bucket, .. } | RateLimitError::ExceedsCapacity { bucket, .. } => {
                Self::Throttled { bucket }
            }
        }
    }
}
