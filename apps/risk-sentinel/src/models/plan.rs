//! Policy output: actions and the plan that orders them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of protective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Cancel the symbol's orders and close its position.
    Flatten,
    /// Partially close a position.
    Reduce,
    /// Cancel every open order on the symbol.
    CancelOrders,
    /// Persist a time-boxed account lockout.
    Lockout,
    /// Nothing to do.
    Noop,
}

impl ActionKind {
    /// Whether the action lowers exposure and must pass through a lockout.
    #[must_use]
    pub const fn is_de_risking(self) -> bool {
        matches!(self, Self::Flatten | Self::Reduce)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flatten => "flatten",
            Self::Reduce => "reduce",
            Self::CancelOrders => "cancel_orders",
            Self::Lockout => "lockout",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine.
    #[default]
    Info,
    /// Guard tripped.
    Warn,
    /// Loss limit breached or lockout enforced.
    Crit,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Crit => write!(f, "crit"),
        }
    }
}

/// A single protective action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// What to do.
    pub kind: ActionKind,
    /// Target symbol, if the action is symbol-scoped.
    pub symbol: Option<String>,
    /// Contract quantity, if the action is sized.
    pub quantity: Option<i64>,
    /// Human-readable trigger.
    pub reason: String,
    /// Severity.
    #[serde(default)]
    pub severity: Severity,
    /// Lockout length override; the store default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
}

impl Action {
    /// Account lockout.
    #[must_use]
    pub fn lockout(reason: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind: ActionKind::Lockout,
            symbol: None,
            quantity: None,
            reason: reason.into(),
            severity,
            duration_minutes: None,
        }
    }

    /// Lockout that expires after `minutes`.
    #[must_use]
    pub fn timed_lockout(reason: impl Into<String>, severity: Severity, minutes: i64) -> Self {
        Self {
            duration_minutes: Some(minutes),
            ..Self::lockout(reason, severity)
        }
    }

    /// Flatten a symbol.
    #[must_use]
    pub fn flatten(symbol: impl Into<String>, quantity: i64, reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Flatten,
            symbol: Some(symbol.into()),
            quantity: Some(quantity),
            reason: reason.into(),
            severity: Severity::Crit,
            duration_minutes: None,
        }
    }

    /// Reduce a symbol by `quantity` contracts.
    #[must_use]
    pub fn reduce(symbol: impl Into<String>, quantity: i64, reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Reduce,
            symbol: Some(symbol.into()),
            quantity: Some(quantity),
            reason: reason.into(),
            severity: Severity::Warn,
            duration_minutes: None,
        }
    }

    /// Cancel all open orders on a symbol.
    #[must_use]
    pub fn cancel_orders(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::CancelOrders,
            symbol: Some(symbol.into()),
            quantity: None,
            reason: reason.into(),
            severity: Severity::Warn,
            duration_minutes: None,
        }
    }

    /// No action.
    #[must_use]
    pub fn noop(reason: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Noop,
            symbol: None,
            quantity: None,
            reason: reason.into(),
            severity: Severity::Info,
            duration_minutes: None,
        }
    }
}

/// Name of the rule that produced a plan, recorded under `notes["policy"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyName {
    /// Daily loss protection.
    DailyLoss,
    /// Persisted lockout in force.
    LockoutActive,
    /// Aggregate or per-symbol size guard.
    SizeGuard,
    /// News blackout window.
    NewsBlackout,
    /// Late session window.
    LateSession,
    /// No rule fired.
    WithinLimits,
}

impl PolicyName {
    /// Stable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DailyLoss => "DailyLoss",
            Self::LockoutActive => "LockoutActive",
            Self::SizeGuard => "SizeGuard",
            Self::NewsBlackout => "NewsBlackout",
            Self::LateSession => "LateSession",
            Self::WithinLimits => "WithinLimits",
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, reasoned output of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    /// Unique per evaluation.
    pub correlation_id: Uuid,
    /// Actions in execution order.
    pub actions: Vec<Action>,
    /// Diagnostic annotations; `policy` names the rule that fired.
    pub notes: BTreeMap<String, String>,
}

impl ActionPlan {
    /// Empty plan with a fresh correlation ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            actions: Vec::new(),
            notes: BTreeMap::new(),
        }
    }

    /// Add an annotation.
    pub fn note(&mut self, key: &str, value: impl ToString) {
        self.notes.insert(key.to_string(), value.to_string());
    }

    /// Rule recorded under `notes["policy"]`.
    #[must_use]
    pub fn policy(&self) -> Option<&str> {
        self.notes.get("policy").map(String::as_str)
    }

    /// Whether the plan contains anything other than no-ops.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.actions.iter().any(|a| a.kind != ActionKind::Noop)
    }

    /// Highest severity across the plan's actions.
    #[must_use]
    pub fn max_severity(&self) -> Severity {
        self.actions
            .iter()
            .map(|a| a.severity)
            .max()
            .unwrap_or_default()
    }
}

impl Default for ActionPlan {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ActionKind::CancelOrders).unwrap();
        assert_eq!(json, "\"cancel_orders\"");
    }

    #[test]
    fn test_severity_defaults_to_info() {
        let action: Action =
            serde_json::from_str(r#"{"kind":"noop","symbol":null,"quantity":null,"reason":"x"}"#)
                .unwrap();
        assert_eq!(action.severity, Severity::Info);
    }

    #[test]
    fn test_de_risking_kinds() {
        assert!(ActionKind::Flatten.is_de_risking());
        assert!(ActionKind::Reduce.is_de_risking());
        assert!(!ActionKind::Lockout.is_de_risking());
        assert!(!ActionKind::CancelOrders.is_de_risking());
    }

    #[test]
    fn test_plan_max_severity_and_policy() {
        let mut plan = ActionPlan::new();
        plan.actions.push(Action::noop("Within limits"));
        assert!(!plan.is_actionable());
        plan.actions.push(Action::lockout("loss", Severity::Crit));
        plan.note("policy", PolicyName::DailyLoss);

        assert!(plan.is_actionable());
        assert_eq!(plan.max_severity(), Severity::Crit);
        assert_eq!(plan.policy(), Some("DailyLoss"));
    }
}
