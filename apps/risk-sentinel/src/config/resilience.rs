//! Rate limit, retry and circuit breaker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{BucketConfig, RateLimitConfig, RetryPolicy, RetryStrategy};
use crate::resilience::CircuitBreakerConfig;

/// One token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Capacity.
    pub max_tokens: u32,
    /// Seconds to refill from empty.
    pub window_secs: u64,
    /// Milliseconds a caller may wait for a token.
    pub acquire_timeout_ms: u64,
}

impl BucketSettings {
    const fn to_bucket_config(self) -> BucketConfig {
        BucketConfig {
            max_tokens: self.max_tokens,
            window: Duration::from_secs(self.window_secs),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

/// Bucket sizes mirroring the upstream API's published limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Account, position and order reads.
    #[serde(default = "default_general")]
    pub general: BucketSettings,
    /// P&L and history reads.
    #[serde(default = "default_market_data")]
    pub market_data: BucketSettings,
    /// Enforcement mutations.
    #[serde(default = "default_emergency")]
    pub emergency: BucketSettings,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            general: default_general(),
            market_data: default_market_data(),
            emergency: default_emergency(),
        }
    }
}

impl RateLimitsConfig {
    /// Runtime limiter configuration.
    #[must_use]
    pub const fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            general: self.general.to_bucket_config(),
            market_data: self.market_data.to_bucket_config(),
            emergency: self.emergency.to_bucket_config(),
        }
    }

    pub(crate) const fn buckets(&self) -> [(&'static str, BucketSettings); 3] {
        [
            ("general", self.general),
            ("market_data", self.market_data),
            ("emergency", self.emergency),
        ]
    }
}

const fn default_general() -> BucketSettings {
    BucketSettings {
        max_tokens: 200,
        window_secs: 60,
        acquire_timeout_ms: 10_000,
    }
}

const fn default_market_data() -> BucketSettings {
    BucketSettings {
        max_tokens: 50,
        window_secs: 30,
        acquire_timeout_ms: 10_000,
    }
}

const fn default_emergency() -> BucketSettings {
    BucketSettings {
        max_tokens: 50,
        window_secs: 60,
        acquire_timeout_ms: 5_000,
    }
}

/// Retry settings for one failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Backoff ceiling (milliseconds).
    pub max_delay_ms: u64,
}

impl StrategySettings {
    const fn to_strategy(self) -> RetryStrategy {
        RetryStrategy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Retry table keyed by failure class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 401 responses.
    #[serde(default = "default_auth")]
    pub auth: StrategySettings,
    /// 429 responses.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: StrategySettings,
    /// 5xx responses.
    #[serde(default = "default_server")]
    pub server: StrategySettings,
    /// Network errors and timeouts.
    #[serde(default = "default_transient")]
    pub transient: StrategySettings,
    /// Lower bound of the jitter factor.
    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,
    /// Upper bound of the jitter factor.
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auth: default_auth(),
            rate_limit: default_rate_limit(),
            server: default_server(),
            transient: default_transient(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

impl RetryConfig {
    /// Runtime retry policy.
    #[must_use]
    pub const fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            auth: self.auth.to_strategy(),
            rate_limit: self.rate_limit.to_strategy(),
            server: self.server.to_strategy(),
            transient: self.transient.to_strategy(),
            jitter_min: self.jitter_min,
            jitter_max: self.jitter_max,
        }
    }
}

const fn default_auth() -> StrategySettings {
    StrategySettings {
        max_retries: 1,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
    }
}

const fn default_rate_limit() -> StrategySettings {
    StrategySettings {
        max_retries: 5,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
    }
}

const fn default_server() -> StrategySettings {
    StrategySettings {
        max_retries: 3,
        base_delay_ms: 500,
        max_delay_ms: 10_000,
    }
}

const fn default_transient() -> StrategySettings {
    default_server()
}

const fn default_jitter_min() -> f64 {
    0.5
}

const fn default_jitter_max() -> f64 {
    1.5
}

/// Circuit breaker settings, applied per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Failures within the window that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before a trial call.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Seconds over which failures are counted.
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            failure_window_secs: default_failure_window_secs(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Runtime breaker configuration.
    #[must_use]
    pub const fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            failure_window: Duration::from_secs(self.failure_window_secs),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_recovery_timeout_secs() -> u64 {
    60
}

const fn default_failure_window_secs() -> u64 {
    60
}
