//! Prometheus metrics for the risk loop.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use super::ObservabilityError;
use crate::resilience::CircuitBreakerState;

/// Start the Prometheus exporter on `addr` (serves `/metrics`).
pub fn init_metrics(addr: SocketAddr) -> Result<(), ObservabilityError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ObservabilityError::Metrics(e.to_string()))?;

    tracing::info!(addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

/// One policy evaluation, labelled by the rule that fired.
pub fn record_evaluation(policy: &str) {
    counter!("risk_evaluations_total", "policy" => policy.to_string()).increment(1);
}

/// One enforcement action outcome.
pub fn record_action(kind: &str, status: &str) {
    counter!(
        "risk_actions_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// One full pass over the monitored accounts.
pub fn record_tick(duration_seconds: f64, accounts: usize, failed: usize) {
    histogram!("risk_tick_duration_seconds").record(duration_seconds);
    counter!("risk_ticks_total").increment(1);
    counter!("risk_account_errors_total").increment(failed as u64);
    gauge!("risk_tick_accounts").set(accounts as f64);
}

/// Number of monitored accounts.
pub fn update_monitored_accounts(count: usize) {
    gauge!("risk_monitored_accounts").set(count as f64);
}

/// One guarded broker call.
///
/// * `outcome` - "ok", "error", "rejected", "throttled" or "circuit_open"
pub fn record_broker_call(endpoint: &str, outcome: &str, latency_seconds: f64) {
    counter!(
        "broker_calls_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("broker_call_duration_seconds", "endpoint" => endpoint.to_string())
        .record(latency_seconds);
}

/// Breaker state gauge: 0 closed, 1 half-open, 2 open.
pub fn record_circuit_breaker_state(endpoint: &str, state: CircuitBreakerState) {
    let value = match state {
        CircuitBreakerState::Closed => 0.0,
        CircuitBreakerState::HalfOpen => 1.0,
        CircuitBreakerState::Open => 2.0,
    };
    gauge!("circuit_breaker_state", "endpoint" => endpoint.to_string()).set(value);
}

/// Local rate limiter refused a call.
pub fn record_rate_limited(bucket: &str) {
    counter!("rate_limiter_throttled_total", "bucket" => bucket.to_string()).increment(1);
}
