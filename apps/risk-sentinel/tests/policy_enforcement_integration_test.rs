//! Policy to enforcement integration tests.
//!
//! Evaluates a recorded context fixture and applies the resulting plan to a
//! simulated broker, covering at-most-once execution and the lockout gate.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use test_case::test_case;

use risk_sentinel::broker::{BrokerCall, SimulatedBroker};
use risk_sentinel::enforcement::{ActionStatus, Disposition, Enforcer};
use risk_sentinel::models::{AccountId, ActionKind, EvaluationContext, Position, RiskTier};
use risk_sentinel::policy::{PolicyBrain, PolicyConfig};
use risk_sentinel::safety::{IdempotencyConfig, IdempotencyStore, LockoutStore};

const CONTEXT_FIXTURE: &str = include_str!("fixtures/context.json");

fn fixture_context() -> EvaluationContext {
    serde_json::from_str(CONTEXT_FIXTURE).unwrap()
}

struct Harness {
    dir: tempfile::TempDir,
    sim: Arc<SimulatedBroker>,
    lockouts: Arc<LockoutStore>,
    enforcer: Enforcer,
}

impl Harness {
    fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }
}

fn harness(ctx: &EvaluationContext) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(SimulatedBroker::new());
    sim.add_account(
        ctx.account_id.clone(),
        ctx.positions.clone(),
        ctx.orders.clone(),
        ctx.day_pnl,
    );
    let lockouts = Arc::new(LockoutStore::open(dir.path(), chrono::Duration::hours(24)).unwrap());
    let enforcer = Enforcer::new(
        sim.clone(),
        lockouts.clone(),
        Arc::new(IdempotencyStore::default()),
    );
    Harness {
        dir,
        sim,
        lockouts,
        enforcer,
    }
}

#[test]
fn test_fixture_context_breaches_daily_loss() {
    let ctx = fixture_context();
    assert_eq!(ctx.risk_tier, RiskTier::T1);
    assert_eq!(ctx.total_contracts(), 3);

    let plan = PolicyBrain::new(PolicyConfig::fallback()).evaluate(&ctx);

    assert_eq!(plan.policy(), Some("DailyLoss"));
    let kinds: Vec<_> = plan.actions.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![ActionKind::Lockout, ActionKind::Flatten, ActionKind::Flatten]
    );
    assert_eq!(plan.actions[1].symbol.as_deref(), Some("ESZ24"));
    assert_eq!(plan.actions[1].quantity, Some(2));
    assert_eq!(plan.actions[2].symbol.as_deref(), Some("NQZ24"));
    assert_eq!(plan.actions[2].quantity, Some(1));
    assert_eq!(plan.notes.get("threshold").map(String::as_str), Some("-300"));
}

#[test_case(dec!(-284), "SizeGuard" ; "inside early warning band")]
#[test_case(dec!(-285), "DailyLoss" ; "at early warning")]
#[test_case(dec!(-400), "DailyLoss" ; "past hard limit")]
fn test_fixture_policy_by_day_pnl(day_pnl: Decimal, policy: &str) {
    let mut ctx = fixture_context();
    ctx.day_pnl = day_pnl;

    let plan = PolicyBrain::new(PolicyConfig::fallback()).evaluate(&ctx);

    // t1 allows two contracts, so the fixture's three trip the size guard
    // when the loss rule stays quiet.
    assert_eq!(plan.policy(), Some(policy));
}

#[tokio::test]
async fn test_daily_loss_plan_flattens_and_persists_lockout() {
    let ctx = fixture_context();
    let h = harness(&ctx);
    let plan = PolicyBrain::new(PolicyConfig::fallback()).evaluate(&ctx);

    let result = h.enforcer.apply(&ctx.account_id, &plan).await;

    assert_eq!(result.disposition, Disposition::Executed);
    assert_eq!(result.count(ActionStatus::Success), 3);
    assert_eq!(result.positions_closed, 2);
    assert!(h.sim.positions(&ctx.account_id).is_empty());

    let record = h.lockouts.get(&ctx.account_id).unwrap().unwrap();
    assert!(record.locked);
    assert!(record.reason.contains("daily loss"));
    assert!(h.lockouts.is_locked(&ctx.account_id).unwrap());
}

#[tokio::test]
async fn test_re_evaluated_plan_executes_once() {
    let ctx = fixture_context();
    let h = harness(&ctx);
    let brain = PolicyBrain::new(PolicyConfig::fallback());

    let first_plan = brain.evaluate(&ctx);
    let second_plan = brain.evaluate(&ctx);
    assert_ne!(first_plan.correlation_id, second_plan.correlation_id);

    let first = h.enforcer.apply(&ctx.account_id, &first_plan).await;
    let calls = h.sim.mutation_count();
    let second = h.enforcer.apply(&ctx.account_id, &second_plan).await;

    assert_eq!(first.disposition, Disposition::Executed);
    assert_eq!(second.disposition, Disposition::Duplicate);
    assert_eq!(second.idempotency_key, first.idempotency_key);
    assert_eq!(second.outcomes, first.outcomes);
    assert_eq!(h.sim.mutation_count(), calls);
}

#[tokio::test]
async fn test_separate_runs_share_idempotency_table() {
    let mut ctx = fixture_context();
    ctx.day_pnl = Decimal::ZERO;
    ctx.positions = vec![Position::new("ESZ24", 3, dec!(4500), Decimal::ZERO)];
    let h = harness(&ctx);
    let table = h.dir().join("state").join("idempotency.json");
    let brain = PolicyBrain::new(PolicyConfig::fallback());

    let run = |path: &std::path::Path| {
        Enforcer::new(
            h.sim.clone(),
            h.lockouts.clone(),
            Arc::new(IdempotencyStore::open(path, IdempotencyConfig::default()).unwrap()),
        )
    };

    // The reduce is a market order; the book has not caught up when the
    // next invocation evaluates the same state.
    let first = run(table.as_path()).apply(&ctx.account_id, &brain.evaluate(&ctx)).await;
    assert_eq!(first.disposition, Disposition::Executed);
    let calls = h.sim.mutation_count();

    let second = run(table.as_path()).apply(&ctx.account_id, &brain.evaluate(&ctx)).await;
    assert_eq!(second.disposition, Disposition::Duplicate);
    assert_eq!(h.sim.mutation_count(), calls);
}

#[tokio::test]
async fn test_lockout_gate_blocks_new_lockout_but_allows_flatten() {
    let ctx = fixture_context();
    let h = harness(&ctx);
    h.lockouts.set(&ctx.account_id, "manual", None).unwrap();
    let before = h.lockouts.get(&ctx.account_id).unwrap().unwrap();

    let plan = PolicyBrain::new(PolicyConfig::fallback()).evaluate(&ctx);
    let result = h.enforcer.apply(&ctx.account_id, &plan).await;

    assert!(result.locked_out);
    assert_eq!(result.outcomes[0].kind, ActionKind::Lockout);
    assert_eq!(result.outcomes[0].status, ActionStatus::Skipped);
    assert_eq!(result.count(ActionStatus::Success), 2);
    assert!(h.sim.positions(&ctx.account_id).is_empty());

    let after = h.lockouts.get(&ctx.account_id).unwrap().unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_size_guard_reduces_largest_position() {
    let mut ctx = fixture_context();
    ctx.day_pnl = Decimal::ZERO;
    ctx.positions = vec![
        Position::new("ESZ24", 3, dec!(4500), Decimal::ZERO),
        Position::new("NQZ24", -1, dec!(16500), Decimal::ZERO),
    ];
    let h = harness(&ctx);

    let plan = PolicyBrain::new(PolicyConfig::fallback()).evaluate(&ctx);
    assert_eq!(plan.policy(), Some("SizeGuard"));

    let result = h.enforcer.apply(&ctx.account_id, &plan).await;

    assert_eq!(result.count(ActionStatus::Success), 1);
    let es = h
        .sim
        .positions(&ctx.account_id)
        .into_iter()
        .find(|p| p.symbol == "ESZ24")
        .unwrap();
    assert_eq!(es.quantity, 1);
    assert!(matches!(
        h.sim.mutation_calls().as_slice(),
        [BrokerCall::PlaceOrder { .. }]
    ));
    assert!(!h.lockouts.is_locked(&AccountId::from("ACC-7")).unwrap());
}
