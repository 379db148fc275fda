//! Plan executor.

use std::sync::Arc;

use chrono::Duration;

use super::{ActionOutcome, ActionStatus, Disposition, EnforcementError, EnforcementResult};
use crate::broker::{BrokerClient, PlaceOrderRequest};
use crate::models::{
    AccountId, Action, ActionKind, ActionPlan, OrderSide, Position, PositionSide, Severity,
};
use crate::observability::record_action;
use crate::safety::{Begin, IdempotencyError, IdempotencyStore, LockoutStore, idempotency_key};

/// Reason recorded for actions refused on a locked account.
pub const LOCKED_OUT: &str = "locked_out";

/// Applies [`ActionPlan`]s to a broker.
///
/// Shares the lockout and idempotency stores with every other component of
/// the process; owns nothing but its configuration.
pub struct Enforcer {
    broker: Arc<dyn BrokerClient>,
    lockouts: Arc<LockoutStore>,
    idempotency: Arc<IdempotencyStore<EnforcementResult>>,
    dry_run: bool,
}

impl std::fmt::Debug for Enforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enforcer")
            .field("lockouts", &self.lockouts.dir())
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct StepReport {
    orders_cancelled: usize,
    contracts: i64,
    position_closed: bool,
}

impl Enforcer {
    /// Create an enforcer.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        lockouts: Arc<LockoutStore>,
        idempotency: Arc<IdempotencyStore<EnforcementResult>>,
    ) -> Self {
        Self {
            broker,
            lockouts,
            idempotency,
            dry_run: false,
        }
    }

    /// Record actions without sending anything.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Whether dry-run mode is on.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Lockout store.
    #[must_use]
    pub fn lockouts(&self) -> &Arc<LockoutStore> {
        &self.lockouts
    }

    /// Whether `account` is locked. An unreadable record counts as locked.
    pub fn is_locked(&self, account: &AccountId) -> bool {
        match self.lockouts.get(account) {
            Ok(record) => record.is_some(),
            Err(e) => {
                tracing::warn!(
                    account_id = %account,
                    error = %e,
                    "Lockout record unreadable, treating account as locked"
                );
                true
            }
        }
    }

    /// Execute `plan` for `account`.
    ///
    /// Never fails as a whole: each action's error is captured in its
    /// [`ActionOutcome`].
    pub async fn apply(&self, account: &AccountId, plan: &ActionPlan) -> EnforcementResult {
        let locked = self.is_locked(account);

        if !plan.is_actionable() {
            if !self.dry_run {
                self.release_previous(account, None);
            }
            let mut result =
                EnforcementResult::new(account.clone(), plan.correlation_id, Disposition::NothingToDo);
            result.locked_out = locked;
            result.outcomes = plan
                .actions
                .iter()
                .map(|a| ActionOutcome::new(a.kind, a.symbol.clone(), ActionStatus::Success))
                .collect();
            return result;
        }

        if self.dry_run {
            return self.dry_run_result(account, plan, locked);
        }

        let key = idempotency_key(account, plan);
        self.release_previous(account, Some(&key));
        match self.idempotency.begin(account.as_str(), &key) {
            Ok(Begin::Started) => {}
            Ok(Begin::AlreadyCompleted(mut prior)) => {
                tracing::info!(
                    account_id = %account,
                    correlation_id = %plan.correlation_id,
                    prior_correlation_id = %prior.correlation_id,
                    key = %key,
                    "Identical plan already enforced, skipping"
                );
                prior.disposition = Disposition::Duplicate;
                return prior;
            }
            Ok(Begin::InProgress) => {
                tracing::warn!(
                    account_id = %account,
                    correlation_id = %plan.correlation_id,
                    key = %key,
                    "Identical plan in progress, skipping"
                );
                let mut result = EnforcementResult::new(
                    account.clone(),
                    plan.correlation_id,
                    Disposition::InProgress,
                );
                result.idempotency_key = Some(key);
                result.locked_out = locked;
                return result;
            }
            Err(e) => {
                tracing::error!(
                    account_id = %account,
                    correlation_id = %plan.correlation_id,
                    key = %key,
                    error = %e,
                    "Idempotency claim not recorded, deferring plan"
                );
                return Self::deferred_result(account, plan, locked, &key, &e);
            }
        }

        let mut result =
            EnforcementResult::new(account.clone(), plan.correlation_id, Disposition::Executed);
        result.idempotency_key = Some(key.clone());
        result.locked_out = locked;

        for action in &plan.actions {
            let outcome = if locked && !action.kind.is_de_risking() {
                ActionOutcome::new(action.kind, action.symbol.clone(), ActionStatus::Skipped)
                    .with_detail(LOCKED_OUT)
            } else {
                self.execute(account, action, &mut result).await
            };
            log_outcome(account, plan, action, &outcome);
            record_action(action.kind.as_str(), outcome.status.as_str());
            result.outcomes.push(outcome);
        }

        let recorded = if result.any_succeeded() {
            self.idempotency.mark_completed(&key, result.clone())
        } else {
            self.idempotency.mark_failed(&key, result.clone())
        };
        if let Err(e) = recorded {
            tracing::error!(
                account_id = %account,
                correlation_id = %plan.correlation_id,
                key = %key,
                error = %e,
                "Failed to record enforcement result"
            );
        }

        tracing::info!(
            account_id = %account,
            correlation_id = %plan.correlation_id,
            succeeded = result.count(ActionStatus::Success),
            failed = result.count(ActionStatus::Failed),
            skipped = result.count(ActionStatus::Skipped),
            deferred = result.count(ActionStatus::Deferred),
            positions_closed = result.positions_closed,
            orders_cancelled = result.orders_cancelled,
            "Plan enforced"
        );
        result
    }

    /// Forget idempotency entries from the account's earlier plans once its
    /// evaluation changes.
    fn release_previous(&self, account: &AccountId, current: Option<&str>) {
        match self.idempotency.supersede(account.as_str(), current) {
            Ok(0) => {}
            Ok(released) => tracing::debug!(
                account_id = %account,
                released,
                "Earlier plan no longer current"
            ),
            Err(e) => tracing::warn!(
                account_id = %account,
                error = %e,
                "Failed to release earlier idempotency entries"
            ),
        }
    }

    fn deferred_result(
        account: &AccountId,
        plan: &ActionPlan,
        locked: bool,
        key: &str,
        error: &IdempotencyError,
    ) -> EnforcementResult {
        let mut result =
            EnforcementResult::new(account.clone(), plan.correlation_id, Disposition::Deferred);
        result.idempotency_key = Some(key.to_string());
        result.locked_out = locked;
        result.outcomes = plan
            .actions
            .iter()
            .map(|a| {
                ActionOutcome::new(a.kind, a.symbol.clone(), ActionStatus::Deferred)
                    .with_detail(error.to_string())
            })
            .collect();
        result
    }

    fn dry_run_result(&self, account: &AccountId, plan: &ActionPlan, locked: bool) -> EnforcementResult {
        let mut result =
            EnforcementResult::new(account.clone(), plan.correlation_id, Disposition::DryRun);
        result.locked_out = locked;
        for action in &plan.actions {
            let outcome = if locked && !action.kind.is_de_risking() {
                ActionOutcome::new(action.kind, action.symbol.clone(), ActionStatus::Skipped)
                    .with_detail(LOCKED_OUT)
            } else {
                ActionOutcome::new(action.kind, action.symbol.clone(), ActionStatus::DryRun)
            };
            log_outcome(account, plan, action, &outcome);
            record_action(action.kind.as_str(), outcome.status.as_str());
            result.outcomes.push(outcome);
        }
        result
    }

    async fn execute(
        &self,
        account: &AccountId,
        action: &Action,
        result: &mut EnforcementResult,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome::new(action.kind, action.symbol.clone(), ActionStatus::Success);

        let errors = match action.kind {
            ActionKind::Flatten => {
                let (report, errors) = self.flatten(account, action).await;
                apply_report(&mut outcome, result, &report);
                errors
            }
            ActionKind::Reduce => match self.reduce(account, action).await {
                Ok(Some(report)) => {
                    apply_report(&mut outcome, result, &report);
                    Vec::new()
                }
                Ok(None) => {
                    return outcome
                        .with_detail("no open position")
                        .with_status(ActionStatus::Skipped);
                }
                Err(e) => vec![e],
            },
            ActionKind::CancelOrders => match self
                .broker
                .cancel_orders(account, action.symbol.as_deref())
                .await
            {
                Ok(n) => {
                    apply_report(
                        &mut outcome,
                        result,
                        &StepReport {
                            orders_cancelled: n,
                            ..StepReport::default()
                        },
                    );
                    Vec::new()
                }
                Err(e) => vec![e.into()],
            },
            ActionKind::Lockout => {
                let duration = action.duration_minutes.map(Duration::minutes);
                match self.lockouts.set(account, &action.reason, duration) {
                    Ok(_) => Vec::new(),
                    Err(e) => vec![e.into()],
                }
            }
            ActionKind::Noop => Vec::new(),
        };

        if errors.is_empty() {
            return outcome;
        }
        let status = if errors.iter().all(EnforcementError::is_not_now) {
            ActionStatus::Deferred
        } else {
            ActionStatus::Failed
        };
        let detail = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        outcome.with_detail(detail).with_status(status)
    }

    /// Cancel the symbol's orders, then close what remains. The two steps are
    /// independent; errors from both are returned.
    async fn flatten(&self, account: &AccountId, action: &Action) -> (StepReport, Vec<EnforcementError>) {
        let mut report = StepReport::default();
        let mut errors = Vec::new();
        let Some(symbol) = action.symbol.as_deref() else {
            errors.push(EnforcementError::MissingField {
                kind: action.kind,
                field: "symbol",
            });
            return (report, errors);
        };

        match self.broker.cancel_orders(account, Some(symbol)).await {
            Ok(n) => report.orders_cancelled = n,
            Err(e) => errors.push(e.into()),
        }

        match self.current_position(account, symbol).await {
            Ok(Some(position)) => {
                let size = position.quantity.abs();
                match self.close(account, &position, size).await {
                    Ok(()) => {
                        report.contracts = size;
                        report.position_closed = true;
                    }
                    Err(e) => errors.push(e),
                }
            }
            Ok(None) => {}
            Err(e) => errors.push(e),
        }

        (report, errors)
    }

    async fn reduce(&self, account: &AccountId, action: &Action) -> Result<Option<StepReport>, EnforcementError> {
        let symbol = action.symbol.as_deref().ok_or(EnforcementError::MissingField {
            kind: action.kind,
            field: "symbol",
        })?;
        let requested = action.quantity.ok_or(EnforcementError::MissingField {
            kind: action.kind,
            field: "quantity",
        })?;

        let Some(position) = self.current_position(account, symbol).await? else {
            return Ok(None);
        };
        let current = position.quantity.abs();
        let size = current.min(requested.abs());
        if size == 0 {
            return Ok(None);
        }

        self.close(account, &position, size).await?;
        Ok(Some(StepReport {
            orders_cancelled: 0,
            contracts: size,
            position_closed: size == current,
        }))
    }

    async fn current_position(
        &self,
        account: &AccountId,
        symbol: &str,
    ) -> Result<Option<Position>, EnforcementError> {
        let positions = self.broker.get_positions(account).await?;
        Ok(positions
            .into_iter()
            .find(|p| p.symbol == symbol && p.quantity != 0))
    }

    async fn close(&self, account: &AccountId, position: &Position, size: i64) -> Result<(), EnforcementError> {
        let side = match PositionSide::from_quantity(position.quantity) {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
            PositionSide::Flat => return Ok(()),
        };
        let request = PlaceOrderRequest::market(&position.symbol, side, size);
        let ack = self.broker.place_order(account, &request).await?;
        tracing::info!(
            account_id = %account,
            symbol = %position.symbol,
            side = %side,
            size,
            order_id = %ack.order_id,
            "Closing order placed"
        );
        Ok(())
    }
}

fn apply_report(outcome: &mut ActionOutcome, result: &mut EnforcementResult, report: &StepReport) {
    outcome.orders_cancelled += report.orders_cancelled;
    outcome.contracts += report.contracts;
    result.orders_cancelled += report.orders_cancelled;
    if report.position_closed {
        result.positions_closed += 1;
    }
}

fn log_outcome(account: &AccountId, plan: &ActionPlan, action: &Action, outcome: &ActionOutcome) {
    let symbol = action.symbol.as_deref().unwrap_or("-");
    let detail = outcome.detail.as_deref().unwrap_or("");
    match action.severity {
        Severity::Crit => tracing::error!(
            account_id = %account,
            correlation_id = %plan.correlation_id,
            kind = %action.kind,
            symbol,
            reason = %action.reason,
            status = outcome.status.as_str(),
            detail,
            "Enforcement action"
        ),
        Severity::Warn => tracing::warn!(
            account_id = %account,
            correlation_id = %plan.correlation_id,
            kind = %action.kind,
            symbol,
            reason = %action.reason,
            status = outcome.status.as_str(),
            detail,
            "Enforcement action"
        ),
        Severity::Info => tracing::info!(
            account_id = %account,
            correlation_id = %plan.correlation_id,
            kind = %action.kind,
            symbol,
            reason = %action.reason,
            status = outcome.status.as_str(),
            detail,
            "Enforcement action"
        ),
    }
}
