//! Tiered risk policy.
//!
//! [`PolicyBrain`] turns an [`EvaluationContext`](crate::models::EvaluationContext)
//! into an [`ActionPlan`](crate::models::ActionPlan) using the thresholds in a
//! [`PolicyConfig`]. Evaluation is pure: no I/O, no clock reads.

mod brain;
mod config;

pub use brain::{DAILY_LOSS_MARGIN, PolicyBrain};
pub use config::{PolicyConfig, PolicyError, TierLimits};
