//! Per-tick evaluation snapshot.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AccountId, Order, Position};

/// Sentinel used for absent minute-based signals. Large enough that no
/// blackout or late-session window can ever be triggered by a missing value.
pub const SAFE_MINUTES: i64 = 9_999;

/// Named risk-limit profile.
///
/// The three standard tiers are closed variants; any other name is carried
/// through as [`RiskTier::Named`] and resolved against the configured table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RiskTier {
    /// Evaluation / smallest account.
    #[default]
    T0,
    /// Intermediate account.
    T1,
    /// Largest standard account.
    T2,
    /// Any other configured tier.
    Named(String),
}

impl RiskTier {
    /// Tier name as used in configuration.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::T0 => "t0",
            Self::T1 => "t1",
            Self::T2 => "t2",
            Self::Named(name) => name,
        }
    }
}

impl From<String> for RiskTier {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "t0" => Self::T0,
            "t1" => Self::T1,
            "t2" => Self::T2,
            _ => Self::Named(s),
        }
    }
}

impl From<&str> for RiskTier {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<RiskTier> for String {
    fn from(tier: RiskTier) -> Self {
        tier.as_str().to_string()
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Auxiliary signals feeding the time-based guards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvSignals {
    /// Minutes since the most recent scheduled news event.
    pub news_minutes_ago: Option<i64>,
    /// Minutes until the trading session closes.
    pub session_minutes_left: Option<i64>,
    /// Whether a persisted lockout is active for the account.
    pub lockout_active: bool,
    /// Whether the market is currently in session.
    pub market_open: Option<bool>,
}

impl EnvSignals {
    /// Minutes since news, or [`SAFE_MINUTES`] when unknown.
    #[must_use]
    pub fn news_minutes_ago(&self) -> i64 {
        self.news_minutes_ago.unwrap_or(SAFE_MINUTES)
    }

    /// Minutes left in session, or [`SAFE_MINUTES`] when unknown.
    #[must_use]
    pub fn session_minutes_left(&self) -> i64 {
        self.session_minutes_left.unwrap_or(SAFE_MINUTES)
    }
}

/// Immutable snapshot of one account's risk-relevant state for a single tick.
///
/// Built fresh for every account on every tick and only ever borrowed by the
/// policy layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Account being evaluated.
    pub account_id: AccountId,
    /// Realized plus unrealized P&L for the trading day.
    pub day_pnl: Decimal,
    /// Lowest day P&L observed so far today.
    #[serde(default)]
    pub max_drawdown_today: Decimal,
    /// Risk tier selecting the policy thresholds.
    pub risk_tier: RiskTier,
    /// Open positions in broker order.
    #[serde(default)]
    pub positions: Vec<Position>,
    /// Open orders in broker order.
    #[serde(default)]
    pub orders: Vec<Order>,
    /// Auxiliary signals.
    #[serde(default)]
    pub env: EnvSignals,
}

impl EvaluationContext {
    /// Sum of absolute position quantities across all symbols.
    #[must_use]
    pub fn total_contracts(&self) -> i64 {
        self.positions.iter().map(Position::abs_quantity).sum()
    }
}
