//! Configuration loading, validation and environment variable interpolation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use risk_sentinel::config::load_config;
//!
//! // Explicit path, then $RISK_SENTINEL_CONFIG, then ./config.yaml, then defaults
//! let config = load_config(None)?;
//! println!("tick every {}s", config.monitor.interval_secs);
//! ```

mod broker;
mod monitor;
mod observability;
mod policy;
mod resilience;
mod session;
mod storage;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use broker::{BrokerConfig, BrokerMode};
pub use monitor::MonitorConfig;
pub use observability::{LoggingConfig, ObservabilityConfig};
pub use policy::PolicySection;
pub use resilience::{
    BucketSettings, CircuitBreakerSettings, RateLimitsConfig, RetryConfig, StrategySettings,
};
pub use session::{NewsConfig, SessionConfig};
pub use storage::StorageConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "RISK_SENTINEL_CONFIG";

/// Config file used when neither a path nor the environment variable is set.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        /// Path to the config file.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("Failed to parse config YAML: {0}")]
    ParseError(#[from] serde_yaml_bw::Error),

    /// Configuration validation failed.
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration structure. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Tick scheduler.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Token buckets.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    /// Retry table.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Per-endpoint circuit breakers.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    /// On-disk state.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Tier table and account mapping.
    #[serde(default)]
    pub policy: PolicySection,
    /// Trading session; no session signals when absent.
    #[serde(default)]
    pub session: Option<SessionConfig>,
    /// News calendar.
    #[serde(default)]
    pub news: NewsConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================
// Configuration Loading
// ============================================

/// Load configuration with environment variable interpolation.
///
/// Resolution order: `path`, then `$RISK_SENTINEL_CONFIG`, then
/// `config.yaml`. An explicitly named file must exist; a missing default file
/// yields the built-in defaults.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let explicit = path
        .map(str::to_string)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok().filter(|p| !p.is_empty()));

    let path = match explicit {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => DEFAULT_CONFIG_PATH.to_string(),
        None => {
            tracing::info!("No config file found, using defaults");
            let config = Config::default();
            validate_config(&config)?;
            return Ok(config);
        }
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
        path: path.clone(),
        source: e,
    })?;
    let config = load_config_from_string(&contents)?;
    tracing::info!(path = %path, "Configuration loaded");
    Ok(config)
}

/// Load configuration from a YAML string (useful for testing).
pub fn load_config_from_string(yaml: &str) -> Result<Config, ConfigError> {
    let interpolated = interpolate_env_vars(yaml);
    let config: Config = serde_yaml_bw::from_str(&interpolated)?;
    validate_config(&config)?;
    Ok(config)
}

/// Interpolate environment variables in a string.
///
/// Supports both `${VAR}` and `${VAR:-default}` syntax.
#[allow(clippy::expect_used)] // Regex is compile-time constant; expect() is safe here
fn interpolate_env_vars(input: &str) -> String {
    use std::sync::OnceLock;

    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("env var regex is valid")
    });

    re.replace_all(input, |cap: &regex::Captures<'_>| {
        let default_value = cap.get(2).map(|m| m.as_str());
        match std::env::var(&cap[1]) {
            Ok(v) if !v.is_empty() => v,
            _ => default_value.map_or_else(String::new, str::to_string),
        }
    })
    .into_owned()
}

/// Validate configuration values.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.monitor.interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "monitor.interval_secs must be positive".to_string(),
        ));
    }
    if config.monitor.stop_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "monitor.stop_timeout_secs must be positive".to_string(),
        ));
    }

    for (name, bucket) in config.rate_limits.buckets() {
        if bucket.max_tokens == 0 || bucket.window_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "rate_limits.{name} needs positive max_tokens and window_secs"
            )));
        }
    }

    let retry = &config.retry;
    if retry.jitter_min <= 0.0 || retry.jitter_min > retry.jitter_max {
        return Err(ConfigError::ValidationError(
            "retry jitter must satisfy 0 < jitter_min <= jitter_max".to_string(),
        ));
    }

    if config.circuit_breaker.failure_threshold == 0 {
        return Err(ConfigError::ValidationError(
            "circuit_breaker.failure_threshold must be positive".to_string(),
        ));
    }

    let storage = &config.storage;
    if storage.lockout_hours <= 0
        || storage.idempotency_max_keys == 0
        || storage.idempotency_ttl_hours <= 0
    {
        return Err(ConfigError::ValidationError(
            "storage lockout_hours, idempotency_max_keys and idempotency_ttl_hours must be positive"
                .to_string(),
        ));
    }

    // Tier table: negative daily_loss, max_per_symbol <= max_contracts, non-empty.
    let tiers = config.policy.to_policy_config()?;
    if !tiers.contains(&config.policy.default_tier) {
        return Err(ConfigError::ValidationError(format!(
            "policy.default_tier {:?} is not a configured tier",
            config.policy.default_tier
        )));
    }
    for (account, tier) in &config.policy.account_tiers {
        if !tiers.contains(tier) {
            tracing::warn!(
                account_id = %account,
                tier = %tier,
                "Unknown tier assigned, most conservative tier will apply"
            );
        }
    }

    if let Some(session) = &config.session {
        session.to_trading_session()?;
    }

    if config.broker.mode == BrokerMode::Projectx && !config.broker.has_credentials() {
        return Err(ConfigError::ValidationError(
            "broker.username and broker.api_key are required for projectx mode".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        validate_config(&config).unwrap();
        assert_eq!(config.monitor.interval_secs, 30);
        assert_eq!(config.rate_limits.general.max_tokens, 200);
        assert_eq!(config.rate_limits.market_data.window_secs, 30);
        assert_eq!(config.rate_limits.emergency.acquire_timeout_ms, 5_000);
        assert_eq!(config.retry.rate_limit.max_retries, 5);
        assert_eq!(config.storage.lockout_hours, 24);
        assert_eq!(config.broker.mode, BrokerMode::Simulated);
        assert!(config.session.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let yaml = r#"
broker:
  mode: simulated
monitor:
  interval_secs: 10
  account_ids: ["ACC-1", "ACC-2"]
  dry_run: true
policy:
  default_tier: t1
  account_tiers:
    ACC-2: t2
  tiers:
    t1: { daily_loss: -300, max_contracts: 2, max_per_symbol: 2, news_blackout_minutes: 20, late_session_minutes: 20 }
    t2: { daily_loss: -600, max_contracts: 4, max_per_symbol: 3, news_blackout_minutes: 30, late_session_minutes: 15 }
session:
  timezone: America/New_York
  open: "09:30"
  close: "16:00"
news:
  events: ["2024-12-06T13:30:00Z"]
logging:
  level: debug
  format: pretty
"#;
        let config = load_config_from_string(yaml).unwrap();
        assert_eq!(config.monitor.interval_secs, 10);
        assert!(config.monitor.dry_run);
        assert_eq!(config.news.events.len(), 1);
        assert_eq!(config.logging.format, "pretty");

        let policy = config.policy.to_policy_config().unwrap();
        assert!(!policy.contains("t0"));
        assert_eq!(policy.most_conservative().0, "t1");
        assert_eq!(policy.most_conservative().1.daily_loss, dec!(-300));

        let tiers = config.policy.tier_assignments();
        assert_eq!(
            tiers.tier_for(&crate::models::AccountId::from("ACC-2")),
            crate::models::RiskTier::T2
        );
        assert_eq!(
            tiers.tier_for(&crate::models::AccountId::from("ACC-9")),
            crate::models::RiskTier::T1
        );

        let settings = config.monitor.to_settings();
        assert_eq!(settings.account_ids.unwrap().len(), 2);
    }

    #[test]
    fn test_env_var_with_default_when_missing() {
        let input = "mode: ${RISK_SENTINEL_TEST_NONEXISTENT_VAR:-simulated}";
        assert_eq!(interpolate_env_vars(input), "mode: simulated");
    }

    #[test]
    fn test_env_var_without_default_becomes_empty() {
        let input = "api_key: ${RISK_SENTINEL_TEST_UNLIKELY_TO_EXIST}";
        assert_eq!(interpolate_env_vars(input), "api_key: ");
    }

    #[test]
    #[expect(clippy::literal_string_with_formatting_args)] // ${...} is env var syntax, not format args
    fn test_env_var_with_default_uses_existing() {
        let result = interpolate_env_vars("path: ${PATH:-default}");
        assert_ne!(result, "path: default");
        assert!(result.starts_with("path: "));
    }

    #[test]
    fn test_validation_zero_interval() {
        let err = load_config_from_string("monitor:\n  interval_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn test_validation_positive_daily_loss() {
        let yaml = r"
policy:
  tiers:
    t0: { daily_loss: 150, max_contracts: 1, max_per_symbol: 1, news_blackout_minutes: 30, late_session_minutes: 30 }
";
        let err = load_config_from_string(yaml).unwrap_err();
        assert!(err.to_string().contains("daily_loss"));
    }

    #[test]
    fn test_validation_per_symbol_over_aggregate() {
        let yaml = r"
policy:
  tiers:
    t0: { daily_loss: -150, max_contracts: 1, max_per_symbol: 2, news_blackout_minutes: 30, late_session_minutes: 30 }
";
        let err = load_config_from_string(yaml).unwrap_err();
        assert!(err.to_string().contains("max_per_symbol"));
    }

    #[test]
    fn test_validation_empty_tiers() {
        let err = load_config_from_string("policy:\n  tiers: {}\n").unwrap_err();
        assert!(err.to_string().contains("no tiers"));
    }

    #[test]
    fn test_validation_unknown_default_tier() {
        let err = load_config_from_string("policy:\n  default_tier: gold\n").unwrap_err();
        assert!(err.to_string().contains("default_tier"));
    }

    #[test]
    fn test_validation_session_close_before_open() {
        let yaml = "session:\n  timezone: UTC\n  open: \"16:00\"\n  close: \"09:00\"\n";
        let err = load_config_from_string(yaml).unwrap_err();
        assert!(err.to_string().contains("after session.open"));
    }

    #[test]
    fn test_validation_projectx_requires_credentials() {
        let err = load_config_from_string("broker:\n  mode: projectx\n").unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = load_config(Some("/nonexistent/risk-sentinel.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
