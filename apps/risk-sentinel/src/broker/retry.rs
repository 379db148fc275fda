//! Failure-class keyed retry with exponential backoff.
//!
//! | Class      | Retries | Base  | Max  | Extra                         |
//! |------------|---------|-------|------|-------------------------------|
//! | auth (401) | 1       | 0.1s  | 1s   | credentials refreshed first   |
//! | rate limit | 5       | 1s    | 60s  | honours `Retry-After`         |
//! | server 5xx | 3       | 0.5s  | 10s  |                               |
//! | network    | 3       | 0.5s  | 10s  |                               |
//! | other 4xx  | 0       |       |      | propagated immediately        |
//!
//! Delay for retry `n` (0-based) is `min(base * 2^n, max)` scaled by a
//! uniform jitter factor so that many accounts retrying at once spread out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{BrokerError, FailureClass};

/// Retry budget and delay bounds for one failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Delay ceiling before jitter.
    pub max_delay: Duration,
}

impl RetryStrategy {
    /// Create a strategy.
    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Un-jittered delay before retry `attempt` (0-based).
    #[must_use]
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Strategy table keyed by [`FailureClass`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 401 handling.
    pub auth: RetryStrategy,
    /// 429 handling.
    pub rate_limit: RetryStrategy,
    /// 5xx handling.
    pub server: RetryStrategy,
    /// Network and timeout handling.
    pub transient: RetryStrategy,
    /// Lower bound of the jitter factor.
    pub jitter_min: f64,
    /// Upper bound of the jitter factor.
    pub jitter_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auth: RetryStrategy::new(1, Duration::from_millis(100), Duration::from_secs(1)),
            rate_limit: RetryStrategy::new(5, Duration::from_secs(1), Duration::from_secs(60)),
            server: RetryStrategy::new(3, Duration::from_millis(500), Duration::from_secs(10)),
            transient: RetryStrategy::new(3, Duration::from_millis(500), Duration::from_secs(10)),
            jitter_min: 0.5,
            jitter_max: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Policy with no jitter, for deterministic delays.
    #[must_use]
    pub fn without_jitter(self) -> Self {
        Self {
            jitter_min: 1.0,
            jitter_max: 1.0,
            ..self
        }
    }

    /// Strategy for a failure class; `None` means never retry.
    #[must_use]
    pub const fn strategy_for(&self, class: FailureClass) -> Option<&RetryStrategy> {
        match class {
            FailureClass::Auth => Some(&self.auth),
            FailureClass::RateLimit => Some(&self.rate_limit),
            FailureClass::Server => Some(&self.server),
            FailureClass::Transient => Some(&self.transient),
            FailureClass::Fatal => None,
        }
    }

    /// Jittered delay before retry `attempt` (0-based).
    #[must_use]
    pub fn backoff(&self, strategy: &RetryStrategy, attempt: u32) -> Duration {
        let base = strategy.base_backoff(attempt);
        let factor = if self.jitter_max > self.jitter_min {
            rand::rng().random_range(self.jitter_min..=self.jitter_max)
        } else {
            self.jitter_min
        };
        base.mul_f64(factor.max(0.0))
    }
}

/// Runs one logical call under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or its
    /// failure class exhausts its retry budget. Auth failures call `refresh`
    /// before retrying; a failed refresh ends the sequence.
    pub async fn execute<T, Op, OpFut, Refresh, RefreshFut>(
        &self,
        label: &str,
        mut op: Op,
        mut refresh: Refresh,
    ) -> Result<T, BrokerError>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = Result<T, BrokerError>>,
        Refresh: FnMut() -> RefreshFut,
        RefreshFut: Future<Output = Result<(), BrokerError>>,
    {
        // Retries used per class: auth, rate limit, server, transient.
        let mut used = [0u32; 4];

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = err.failure_class();
            let Some(strategy) = self.policy.strategy_for(class) else {
                return Err(err);
            };
            let slot = match class {
                FailureClass::Auth => 0,
                FailureClass::RateLimit => 1,
                FailureClass::Server => 2,
                _ => 3,
            };
            let attempt = used[slot];
            if attempt >= strategy.max_retries {
                tracing::warn!(
                    call = label,
                    class = ?class,
                    retries = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            if class == FailureClass::Auth {
                tracing::info!(call = label, "Refreshing credentials after 401");
                refresh().await?;
            }

            let delay = match &err {
                BrokerError::RateLimited {
                    retry_after: Some(after),
                } => (*after).min(strategy.max_delay),
                _ => self.policy.backoff(strategy, attempt),
            };

            tracing::debug!(
                call = label,
                class = ?class,
                attempt = attempt + 1,
                delay_ms = delay.as_millis(),
                error = %err,
                "Retrying broker call"
            );
            tokio::time::sleep(delay).await;
            used[slot] += 1;
        }
    }
}
