//! Process-wide protective state.
//!
//! - [`LockoutStore`]: persisted per-account lockouts with lazy expiry
//! - [`IdempotencyStore`]: at-most-once enforcement per distinct plan,
//!   optionally persisted

mod idempotency;
mod lockout;

pub use idempotency::{
    Begin, IdempotencyConfig, IdempotencyEntry, IdempotencyError, IdempotencyStatus,
    IdempotencyStore, idempotency_key,
};
pub use lockout::{LockoutError, LockoutRecord, LockoutStore};
