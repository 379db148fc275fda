//! Enforcement outcome records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AccountId, ActionKind};

/// Outcome of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Every step succeeded.
    Success,
    /// At least one step failed at the broker or store.
    Failed,
    /// Not attempted (locked out, nothing to reduce).
    Skipped,
    /// Refused locally by the rate limiter or an open breaker; retried next tick.
    Deferred,
    /// Dry-run mode; nothing was sent.
    DryRun,
}

impl ActionStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Deferred => "deferred",
            Self::DryRun => "dry_run",
        }
    }
}

/// Record of one attempted action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Action kind.
    pub kind: ActionKind,
    /// Target symbol.
    pub symbol: Option<String>,
    /// Result.
    pub status: ActionStatus,
    /// Error text or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Orders cancelled by this action.
    #[serde(default)]
    pub orders_cancelled: usize,
    /// Contracts sent to close or reduce.
    #[serde(default)]
    pub contracts: i64,
}

impl ActionOutcome {
    pub(crate) fn new(kind: ActionKind, symbol: Option<String>, status: ActionStatus) -> Self {
        Self {
            kind,
            symbol,
            status,
            detail: None,
            orders_cancelled: 0,
            contracts: 0,
        }
    }

    pub(crate) const fn with_status(mut self, status: ActionStatus) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// How the plan as a whole was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Actions were attempted.
    Executed,
    /// An identical plan already completed; its stored result is returned.
    Duplicate,
    /// An identical plan is being executed elsewhere.
    InProgress,
    /// The idempotency claim could not be recorded; nothing was sent.
    Deferred,
    /// Dry-run mode.
    DryRun,
    /// Plan held only no-ops.
    NothingToDo,
}

/// Aggregate result of enforcing one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementResult {
    /// Account.
    pub account_id: AccountId,
    /// Correlation ID of the plan that produced this result.
    pub correlation_id: Uuid,
    /// Plan hash, when the idempotency store was consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Plan-level handling.
    pub disposition: Disposition,
    /// Whether the account was locked when the plan arrived.
    #[serde(default)]
    pub locked_out: bool,
    /// Per-action outcomes in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// Positions fully closed.
    pub positions_closed: usize,
    /// Orders cancelled.
    pub orders_cancelled: usize,
}

impl EnforcementResult {
    pub(crate) fn new(account_id: AccountId, correlation_id: Uuid, disposition: Disposition) -> Self {
        Self {
            account_id,
            correlation_id,
            idempotency_key: None,
            disposition,
            locked_out: false,
            outcomes: Vec::new(),
            positions_closed: 0,
            orders_cancelled: 0,
        }
    }

    /// Number of outcomes with `status`.
    #[must_use]
    pub fn count(&self, status: ActionStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Whether at least one action succeeded.
    #[must_use]
    pub fn any_succeeded(&self) -> bool {
        self.count(ActionStatus::Success) > 0
    }

    /// Number of actions that reached the broker or store.
    #[must_use]
    pub fn executed_actions(&self) -> usize {
        self.count(ActionStatus::Success) + self.count(ActionStatus::Failed)
    }
}
