//! Configuration integration tests.
//!
//! Loads the fixture file from disk and checks that each section resolves
//! into the runtime types the binary wires together.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

use risk_sentinel::config::{BrokerMode, ConfigError, load_config, load_config_from_string};
use risk_sentinel::models::{AccountId, RiskTier};

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/config.yaml")
}

#[test]
fn test_fixture_file_loads_every_section() {
    let config = load_config(Some(fixture_path().to_str().unwrap())).unwrap();

    assert_eq!(config.broker.mode, BrokerMode::Simulated);
    assert_eq!(config.monitor.interval_secs, 1);
    assert_eq!(config.rate_limits.general.max_tokens, 100);
    // Unlisted buckets keep their defaults.
    assert_eq!(config.rate_limits.market_data.max_tokens, 50);
    assert_eq!(config.retry.server.max_retries, 1);
    assert_eq!(config.circuit_breaker.failure_threshold, 3);
    assert_eq!(config.storage.lockout_hours, 12);
    assert_eq!(
        config.storage.idempotency_path,
        "runtime/state/idempotency.json"
    );
    assert_eq!(config.news.events.len(), 1);
    assert_eq!(config.logging.format, "compact");
    assert!(config.observability.metrics_addr.is_none());
}

#[test]
fn test_fixture_interpolates_defaults() {
    // The fixture references an unset variable with a fallback.
    let config = load_config(Some(fixture_path().to_str().unwrap())).unwrap();
    if std::env::var("SENTINEL_TEST_USERNAME").is_err() {
        assert_eq!(config.broker.username, "demo-user");
    }
}

#[test]
fn test_fixture_resolves_runtime_types() {
    let config = load_config(Some(fixture_path().to_str().unwrap())).unwrap();

    let settings = config.monitor.to_settings();
    assert_eq!(settings.interval, Duration::from_secs(1));
    assert_eq!(settings.stop_timeout, Duration::from_secs(2));
    assert!(settings.account_ids.is_none());

    let policy = config.policy.to_policy_config().unwrap();
    assert!(policy.contains("t0"));
    assert!(policy.contains("t2"));
    assert!(!policy.contains("t1"));
    let (name, limits) = policy.limits_for(&RiskTier::T1);
    assert_eq!(name, "t0");
    assert_eq!(limits.daily_loss, dec!(-150));

    let tiers = config.policy.tier_assignments();
    assert_eq!(tiers.tier_for(&AccountId::from("SIM-001")), RiskTier::T2);
    assert_eq!(tiers.tier_for(&AccountId::from("SIM-404")), RiskTier::T0);

    let idempotency = config.storage.idempotency();
    assert_eq!(idempotency.max_keys, 500);
    assert_eq!(idempotency.ttl, chrono::Duration::hours(6));
}

#[test]
fn test_fixture_session_follows_exchange_time() {
    let config = load_config(Some(fixture_path().to_str().unwrap())).unwrap();
    let session = config.session.unwrap().to_trading_session().unwrap();

    // Friday 2024-12-06, 14:40 in Chicago (UTC-6).
    let late = Utc.with_ymd_and_hms(2024, 12, 6, 20, 40, 0).unwrap();
    assert!(session.is_open_at(late));
    assert_eq!(session.minutes_left_at(late), Some(20));

    let saturday = Utc.with_ymd_and_hms(2024, 12, 7, 16, 0, 0).unwrap();
    assert!(!session.is_open_at(saturday));
    assert_eq!(session.minutes_left_at(saturday), None);

    let calendar = config.news.to_calendar();
    let after_release = Utc.with_ymd_and_hms(2024, 12, 6, 13, 45, 0).unwrap();
    assert_eq!(calendar.minutes_since_last(after_release), Some(15));
}

#[test]
fn test_policy_document_path() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("policy.yaml");
    std::fs::write(
        &doc,
        "funded:\n  daily_loss: -1000\n  max_contracts: 6\n  max_per_symbol: 4\n  news_blackout_minutes: 10\n  late_session_minutes: 10\n",
    )
    .unwrap();

    let yaml = format!(
        "policy:\n  path: {}\n  default_tier: funded\n",
        doc.display()
    );
    let config = assert_ok!(load_config_from_string(&yaml));
    let policy = assert_ok!(config.policy.to_policy_config());
    let (name, limits) = policy.limits_for(&RiskTier::from("funded"));
    assert_eq!(name, "funded");
    assert_eq!(limits.max_contracts, 6);
}

#[test]
fn test_policy_document_missing_is_rejected() {
    let yaml = "policy:\n  path: /nonexistent/risk-sentinel/policy.yaml\n";
    let err = assert_err!(load_config_from_string(yaml));
    assert!(matches!(err, ConfigError::ValidationError(msg) if msg.contains("policy.path")));
}

#[test]
fn test_malformed_yaml_is_parse_error() {
    let err = load_config_from_string("monitor: [unclosed").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}
