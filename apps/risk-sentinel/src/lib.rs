// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Risk Sentinel - autonomous protection for funded futures accounts.
//!
//! Every tick, for every monitored account:
//!
//! 1. [`monitor::ContextBuilder`] samples positions, orders and day P&L into an
//!    immutable [`EvaluationContext`]
//! 2. [`PolicyBrain`] evaluates the tiered rules into an [`ActionPlan`]
//! 3. [`Enforcer`] applies the plan, honouring lockouts and executing each
//!    distinct plan at most once
//! 4. [`monitor::TickEventLog`] records inputs, decision and outcome
//!
//! # Modules
//!
//! - `models`: context, plan and account records
//! - `policy`: tier table and rule engine
//! - `broker`: client contract, rate limiter, retry, HTTP and simulated clients
//! - `resilience`: per-endpoint circuit breaker
//! - `safety`: lockout and idempotency stores
//! - `enforcement`: plan executor
//! - `monitor`: context builder, tick scheduler, event log
//! - `config`: YAML configuration with env interpolation
//! - `observability`: tracing and Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod policy;
pub mod resilience;
pub mod safety;

pub use broker::{BrokerClient, BrokerError, GuardedBroker, SimulatedBroker};
pub use enforcement::{EnforcementResult, Enforcer};
pub use error::{Error, Result};
pub use models::{AccountId, Action, ActionKind, ActionPlan, EvaluationContext, RiskTier, Severity};
pub use monitor::{MonitorStatus, RiskMonitor};
pub use policy::{PolicyBrain, PolicyConfig};
pub use safety::{IdempotencyStore, LockoutStore};
