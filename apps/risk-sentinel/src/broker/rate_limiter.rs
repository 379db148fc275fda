//! Token-bucket admission control.
//!
//! Three independent buckets mirror the upstream API's published ceilings:
//!
//! | Bucket       | Capacity | Window | Acquire timeout |
//! |--------------|----------|--------|-----------------|
//! | general      | 200      | 60s    | 10s             |
//! | market_data  | 50       | 30s    | 10s             |
//! | emergency    | 50       | 60s    | 5s              |
//!
//! An exhausted bucket fails closed: the caller receives a
//! [`RateLimitError`] meaning "do not call the API now", never an API error.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::observability;

/// Interval between token checks while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Named capacity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    /// Account, position and order reads.
    General,
    /// P&L and history reads.
    MarketData,
    /// Enforcement mutations.
    Emergency,
}

impl BucketKind {
    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::MarketData => "market_data",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local admission failure.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// Tokens did not become available before the timeout.
    #[error("no {bucket} tokens within {timeout:?}")]
    Timeout {
        /// Bucket.
        bucket: BucketKind,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// More tokens requested than the bucket can ever hold.
    #[error("{requested} tokens exceed {bucket} capacity {capacity}")]
    ExceedsCapacity {
        /// Bucket.
        bucket: BucketKind,
        /// Tokens requested.
        requested: u32,
        /// Bucket capacity.
        capacity: u32,
    },
}

/// Configuration for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Capacity.
    pub max_tokens: u32,
    /// Time to refill from empty to full.
    pub window: Duration,
    /// Default wait for [`RateLimiter::acquire`].
    pub acquire_timeout: Duration,
}

impl BucketConfig {
    /// Tokens regenerated per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.max_tokens) / self.window.as_secs_f64().max(f64::EPSILON)
    }
}

/// Configuration for all three buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// General bucket.
    pub general: BucketConfig,
    /// Market-data bucket.
    pub market_data: BucketConfig,
    /// Emergency bucket.
    pub emergency: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general: BucketConfig {
                max_tokens: 200,
                window: Duration::from_secs(60),
                acquire_timeout: Duration::from_secs(10),
            },
            market_data: BucketConfig {
                max_tokens: 50,
                window: Duration::from_secs(30),
                acquire_timeout: Duration::from_secs(10),
            },
            emergency: BucketConfig {
                max_tokens: 50,
                window: Duration::from_secs(60),
                acquire_timeout: Duration::from_secs(5),
            },
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    kind: BucketKind,
    max_tokens: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(kind: BucketKind, max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            kind,
            max_tokens: f64::from(max_tokens),
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(max_tokens),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket name.
    #[must_use]
    pub const fn kind(&self) -> BucketKind {
        self.kind
    }

    /// Refill, then take `tokens` if available.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let wanted = f64::from(tokens);
        if state.tokens >= wanted {
            state.tokens -= wanted;
            true
        } else {
            false
        }
    }

    /// Take `tokens`, polling until they regenerate or `timeout` elapses.
    /// A zero timeout on an empty bucket fails immediately.
    pub async fn acquire(&self, tokens: u32, timeout: Duration) -> Result<(), RateLimitError> {
        if f64::from(tokens) > self.max_tokens {
            return Err(RateLimitError::ExceedsCapacity {
                bucket: self.kind,
                requested: tokens,
                capacity: self.max_tokens as u32,
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(tokens) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    bucket = %self.kind,
                    requested = tokens,
                    timeout_ms = timeout.as_millis(),
                    "Rate limiter timeout"
                );
                observability::record_rate_limited(self.kind.as_str());
                return Err(RateLimitError::Timeout {
                    bucket: self.kind,
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Tokens currently available (after refill).
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = elapsed
            .mul_add(self.refill_rate, state.tokens)
            .min(self.max_tokens);
        state.last_refill = now;
    }
}

/// Snapshot of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    /// Bucket.
    pub bucket: BucketKind,
    /// Tokens available now.
    pub available: f64,
    /// Capacity.
    pub capacity: f64,
}

/// The three upstream rate ceilings.
#[derive(Debug)]
pub struct RateLimiter {
    general: TokenBucket,
    market_data: TokenBucket,
    emergency: TokenBucket,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Build all buckets full.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = |kind, c: &BucketConfig| TokenBucket::new(kind, c.max_tokens, c.refill_rate());
        Self {
            general: bucket(BucketKind::General, &config.general),
            market_data: bucket(BucketKind::MarketData, &config.market_data),
            emergency: bucket(BucketKind::Emergency, &config.emergency),
            config,
        }
    }

    /// Bucket for a call class.
    #[must_use]
    pub const fn bucket(&self, kind: BucketKind) -> &TokenBucket {
        match kind {
            BucketKind::General => &self.general,
            BucketKind::MarketData => &self.market_data,
            BucketKind::Emergency => &self.emergency,
        }
    }

    /// Take one token from `kind` within its configured timeout.
    pub async fn acquire(&self, kind: BucketKind) -> Result<(), RateLimitError> {
        let timeout = match kind {
            BucketKind::General => self.config.general.acquire_timeout,
            BucketKind::MarketData => self.config.market_data.acquire_timeout,
            BucketKind::Emergency => self.config.emergency.acquire_timeout,
        };
        self.bucket(kind).acquire(1, timeout).await
    }

    /// Snapshot of all buckets.
    #[must_use]
    pub fn status(&self) -> Vec<BucketStatus> {
        [&self.general, &self.market_data, &self.emergency]
            .into_iter()
            .map(|b| BucketStatus {
                bucket: b.kind,
                available: b.available(),
                capacity: b.max_tokens,
            })
            .collect()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
