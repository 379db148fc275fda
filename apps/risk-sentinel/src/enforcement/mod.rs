//! Turns action plans into broker calls.
//!
//! The [`Enforcer`] honours lockouts (only de-risking actions pass a locked
//! account), deduplicates identical plans through the idempotency store, and
//! attempts every permitted action even when earlier ones fail.

mod enforcer;
mod result;

pub use enforcer::{Enforcer, LOCKED_OUT};
pub use result::{ActionOutcome, ActionStatus, Disposition, EnforcementResult};

use crate::broker::BrokerError;
use crate::models::ActionKind;
use crate::safety::LockoutError;

/// Failure of a single enforcement step.
#[derive(Debug, thiserror::Error)]
pub enum EnforcementError {
    /// Broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Lockout store failed.
    #[error(transparent)]
    Lockout(#[from] LockoutError),

    /// Action is missing a field its kind requires.
    #[error("{kind} action without {field}")]
    MissingField {
        /// Action kind.
        kind: ActionKind,
        /// Missing field.
        field: &'static str,
    },
}

impl EnforcementError {
    /// Whether the step was refused locally and should simply be retried on a
    /// later tick.
    #[must_use]
    pub const fn is_not_now(&self) -> bool {
        match self {
            Self::Broker(e) => e.is_not_now(),
            Self::Lockout(_) | Self::MissingField { .. } => false,
        }
    }
}
