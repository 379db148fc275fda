//! Per-tick [`EvaluationContext`] assembly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::MonitorError;
use super::session::{NewsCalendar, TradingSession};
use crate::broker::BrokerClient;
use crate::models::{AccountId, EnvSignals, EvaluationContext, RiskTier};
use crate::safety::LockoutStore;

/// Maps accounts to risk tiers.
#[derive(Debug, Clone, Default)]
pub struct TierAssignments {
    by_account: HashMap<AccountId, RiskTier>,
    default_tier: RiskTier,
}

impl TierAssignments {
    /// Create from explicit assignments and a fallback tier.
    #[must_use]
    pub const fn new(by_account: HashMap<AccountId, RiskTier>, default_tier: RiskTier) -> Self {
        Self {
            by_account,
            default_tier,
        }
    }

    /// Tier for `account`.
    #[must_use]
    pub fn tier_for(&self, account: &AccountId) -> RiskTier {
        self.by_account
            .get(account)
            .cloned()
            .unwrap_or_else(|| self.default_tier.clone())
    }
}

#[derive(Debug, Clone, Copy)]
struct Drawdown {
    date: NaiveDate,
    low: Decimal,
}

/// Builds one immutable snapshot per account per tick.
pub struct ContextBuilder {
    broker: Arc<dyn BrokerClient>,
    lockouts: Arc<LockoutStore>,
    tiers: TierAssignments,
    session: Option<TradingSession>,
    news: NewsCalendar,
    drawdowns: Mutex<HashMap<AccountId, Drawdown>>,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("tiers", &self.tiers)
            .field("session", &self.session)
            .field("news_events", &self.news.len())
            .finish_non_exhaustive()
    }
}

impl ContextBuilder {
    /// Create a builder with no session or news signals.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>, lockouts: Arc<LockoutStore>, tiers: TierAssignments) -> Self {
        Self {
            broker,
            lockouts,
            tiers,
            session: None,
            news: NewsCalendar::default(),
            drawdowns: Mutex::new(HashMap::new()),
        }
    }

    /// Derive session signals from `session`.
    #[must_use]
    pub const fn with_session(mut self, session: Option<TradingSession>) -> Self {
        self.session = session;
        self
    }

    /// Derive news signals from `news`.
    #[must_use]
    pub fn with_news(mut self, news: NewsCalendar) -> Self {
        self.news = news;
        self
    }

    /// Snapshot `account` now.
    pub async fn build(&self, account: &AccountId) -> Result<EvaluationContext, MonitorError> {
        self.build_at(account, Utc::now()).await
    }

    /// Snapshot `account` as of `now`.
    pub async fn build_at(
        &self,
        account: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<EvaluationContext, MonitorError> {
        let positions = self.broker.get_positions(account).await?;
        let orders = self.broker.get_open_orders(account).await?;
        let day_pnl = self.broker.get_day_pnl(account).await?;

        Ok(EvaluationContext {
            timestamp: now,
            account_id: account.clone(),
            day_pnl,
            max_drawdown_today: self.track_drawdown(account, day_pnl, now),
            risk_tier: self.tiers.tier_for(account),
            positions,
            orders: orders.into_iter().filter(|o| o.status.is_open()).collect(),
            env: self.env_signals(account, now),
        })
    }

    /// Environment signals for `account` at `now`.
    #[must_use]
    pub fn env_signals(&self, account: &AccountId, now: DateTime<Utc>) -> EnvSignals {
        let lockout_active = match self.lockouts.get_at(account, now) {
            Ok(record) => record.is_some(),
            Err(e) => {
                tracing::warn!(
                    account_id = %account,
                    error = %e,
                    "Lockout record unreadable, treating account as locked"
                );
                true
            }
        };

        EnvSignals {
            news_minutes_ago: self.news.minutes_since_last(now),
            session_minutes_left: self.session.and_then(|s| s.minutes_left_at(now)),
            lockout_active,
            market_open: self.session.map(|s| s.is_open_at(now)),
        }
    }

    /// Lowest day P&L seen for `account` on the current trading date,
    /// never above zero.
    fn track_drawdown(&self, account: &AccountId, day_pnl: Decimal, now: DateTime<Utc>) -> Decimal {
        let date = self.session.map_or_else(
            || now.date_naive(),
            |s| now.with_timezone(&s.timezone()).date_naive(),
        );
        let observed = day_pnl.min(Decimal::ZERO);

        let mut drawdowns = self.drawdowns.lock();
        let entry = drawdowns
            .entry(account.clone())
            .or_insert(Drawdown { date, low: observed });
        if entry.date == date {
            entry.low = entry.low.min(observed);
        } else {
            *entry = Drawdown { date, low: observed };
        }
        entry.low
    }
}
