//! Logging and metrics.
//!
//! Tracing is initialised once by the binary; metrics are emitted through the
//! `metrics` facade and only exported when a Prometheus listener is
//! configured. Without an installed recorder every `record_*` call is a no-op.

mod logging;
mod metrics;

pub use logging::{ObservabilityError, init_tracing};
pub use self::metrics::{
    init_metrics, record_action, record_broker_call, record_circuit_breaker_state,
    record_evaluation, record_rate_limited, record_tick, update_monitored_accounts,
};
