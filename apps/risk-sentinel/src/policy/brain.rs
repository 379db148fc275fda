//! Ordered rule evaluation.
//!
//! Rules run in a fixed priority order and the first one that fires returns
//! immediately, so every plan describes exactly one diagnosed cause:
//!
//! 1. Daily loss protection (lockout + flatten everything)
//! 2. Lockout already active
//! 3. Aggregate size guard
//! 4. Per-symbol size guard
//! 5. News blackout
//! 6. Late session
//! 7. No-op

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{PolicyConfig, TierLimits};
use crate::models::{Action, ActionPlan, EvaluationContext, PolicyName, Severity};

/// Early-warning factor applied to the daily loss limit (fires at 95%).
pub const DAILY_LOSS_MARGIN: Decimal = dec!(0.95);

/// Deterministic rule engine.
#[derive(Debug, Clone, Default)]
pub struct PolicyBrain {
    config: PolicyConfig,
}

impl PolicyBrain {
    /// Create a brain over a tier table.
    #[must_use]
    pub const fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Tier table in use.
    #[must_use]
    pub const fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluate a context into an action plan.
    ///
    /// Apart from the fresh correlation ID, the same context always yields
    /// the same plan.
    #[must_use]
    pub fn evaluate(&self, ctx: &EvaluationContext) -> ActionPlan {
        let (tier, limits) = self.config.limits_for(&ctx.risk_tier);
        let mut plan = ActionPlan::new();
        plan.note("tier", tier);

        let fired = daily_loss(ctx, tier, limits, &mut plan)
            || lockout_active(ctx, &mut plan)
            || aggregate_size(ctx, limits, &mut plan)
            || per_symbol_size(ctx, limits, &mut plan)
            || news_blackout(ctx, limits, &mut plan)
            || late_session(ctx, limits, &mut plan);

        if !fired {
            plan.actions.push(Action::noop("Within limits"));
            plan.note("policy", PolicyName::WithinLimits);
            plan.note("day_pnl", ctx.day_pnl);
            plan.note("total_contracts", ctx.total_contracts());
            plan.note("open_orders", ctx.orders.len());
        }

        plan
    }
}

fn daily_loss(
    ctx: &EvaluationContext,
    tier: &str,
    limits: &TierLimits,
    plan: &mut ActionPlan,
) -> bool {
    let trigger = limits.daily_loss * DAILY_LOSS_MARGIN;
    if ctx.day_pnl > trigger {
        return false;
    }

    plan.actions.push(Action::lockout(
        format!("Hit {tier} daily loss"),
        Severity::Crit,
    ));
    for position in ctx.positions.iter().filter(|p| p.quantity != 0) {
        plan.actions.push(Action::flatten(
            &position.symbol,
            position.abs_quantity(),
            "DailyLossLock",
        ));
    }

    let breach_pct = (ctx.day_pnl / limits.daily_loss * Decimal::ONE_HUNDRED).round_dp(1);
    plan.note("policy", PolicyName::DailyLoss);
    plan.note("threshold", limits.daily_loss);
    plan.note("trigger", trigger);
    plan.note("current", ctx.day_pnl);
    plan.note("breach_pct", breach_pct);
    true
}

fn lockout_active(ctx: &EvaluationContext, plan: &mut ActionPlan) -> bool {
    if !ctx.env.lockout_active {
        return false;
    }
    plan.actions
        .push(Action::lockout("Lockout active", Severity::Crit));
    plan.note("policy", PolicyName::LockoutActive);
    true
}

fn aggregate_size(ctx: &EvaluationContext, limits: &TierLimits, plan: &mut ActionPlan) -> bool {
    let total = ctx.total_contracts();
    if total <= limits.max_contracts {
        return false;
    }

    // Strict comparison keeps the first seen on ties.
    let largest = ctx.positions.iter().reduce(|best, p| {
        if p.abs_quantity() > best.abs_quantity() {
            p
        } else {
            best
        }
    });
    let Some(largest) = largest else {
        return false;
    };

    let overflow = total - limits.max_contracts;
    plan.actions
        .push(Action::reduce(&largest.symbol, overflow, "MaxContracts"));
    plan.note("policy", PolicyName::SizeGuard);
    plan.note("scope", "aggregate");
    plan.note("total_contracts", total);
    plan.note("limit", limits.max_contracts);
    true
}

fn per_symbol_size(ctx: &EvaluationContext, limits: &TierLimits, plan: &mut ActionPlan) -> bool {
    // Preserve first-seen symbol order.
    let mut per_symbol: Vec<(&str, i64)> = Vec::new();
    for position in &ctx.positions {
        match per_symbol
            .iter_mut()
            .find(|(symbol, _)| *symbol == position.symbol)
        {
            Some((_, qty)) => *qty += position.abs_quantity(),
            None => per_symbol.push((&position.symbol, position.abs_quantity())),
        }
    }

    let Some((symbol, qty)) = per_symbol
        .into_iter()
        .find(|(_, qty)| *qty > limits.max_per_symbol)
    else {
        return false;
    };

    plan.actions.push(Action::reduce(
        symbol,
        qty - limits.max_per_symbol,
        "MaxPerSymbol",
    ));
    plan.note("policy", PolicyName::SizeGuard);
    plan.note("scope", "per_symbol");
    plan.note("symbol", symbol);
    plan.note("symbol_contracts", qty);
    plan.note("limit", limits.max_per_symbol);
    true
}

fn news_blackout(ctx: &EvaluationContext, limits: &TierLimits, plan: &mut ActionPlan) -> bool {
    let minutes_ago = ctx.env.news_minutes_ago();
    if minutes_ago >= limits.news_blackout_minutes {
        return false;
    }

    let remaining = limits.news_blackout_minutes - minutes_ago;
    plan.actions.push(Action::timed_lockout(
        format!("News blackout: {remaining}m remaining"),
        Severity::Warn,
        remaining,
    ));
    plan.note("policy", PolicyName::NewsBlackout);
    plan.note("news_minutes_ago", minutes_ago);
    plan.note("remaining_minutes", remaining);
    true
}

fn late_session(ctx: &EvaluationContext, limits: &TierLimits, plan: &mut ActionPlan) -> bool {
    let minutes_left = ctx.env.session_minutes_left();
    if minutes_left >= limits.late_session_minutes {
        return false;
    }

    plan.actions.push(Action::timed_lockout(
        format!("Late session: {minutes_left}m to close"),
        Severity::Info,
        minutes_left.max(1),
    ));
    plan.note("policy", PolicyName::LateSession);
    plan.note("session_minutes_left", minutes_left);
    true
}
