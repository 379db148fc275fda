//! Core data models for the risk control loop.
//!
//! Broker payloads are mapped into these types at the client boundary; the
//! policy and enforcement layers never see untyped data.

mod account;
mod context;
mod plan;

pub use account::{AccountId, Order, OrderSide, OrderStatus, OrderType, Position, PositionSide};
pub use context::{EnvSignals, EvaluationContext, RiskTier, SAFE_MINUTES};
pub use plan::{Action, ActionKind, ActionPlan, PolicyName, Severity};
