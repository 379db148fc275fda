//! On-disk state locations and store bounds.

use serde::{Deserialize, Serialize};

use crate::safety::IdempotencyConfig;

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of per-account lockout records.
    #[serde(default = "default_lockout_dir")]
    pub lockout_dir: String,
    /// File holding the idempotency table.
    #[serde(default = "default_idempotency_path")]
    pub idempotency_path: String,
    /// Directory of daily tick event logs.
    #[serde(default = "default_events_dir")]
    pub events_dir: String,
    /// Default lockout length (hours).
    #[serde(default = "default_lockout_hours")]
    pub lockout_hours: i64,
    /// Idempotency table capacity.
    #[serde(default = "default_idempotency_max_keys")]
    pub idempotency_max_keys: usize,
    /// Idempotency entry lifetime (hours).
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lockout_dir: default_lockout_dir(),
            idempotency_path: default_idempotency_path(),
            events_dir: default_events_dir(),
            lockout_hours: default_lockout_hours(),
            idempotency_max_keys: default_idempotency_max_keys(),
            idempotency_ttl_hours: default_idempotency_ttl_hours(),
        }
    }
}

impl StorageConfig {
    /// Default lockout duration.
    #[must_use]
    pub const fn lockout_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lockout_hours)
    }

    /// Idempotency store bounds.
    #[must_use]
    pub const fn idempotency(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            max_keys: self.idempotency_max_keys,
            ttl: chrono::Duration::hours(self.idempotency_ttl_hours),
        }
    }
}

fn default_lockout_dir() -> String {
    "runtime/lockouts".to_string()
}

fn default_idempotency_path() -> String {
    "runtime/idempotency.json".to_string()
}

fn default_events_dir() -> String {
    "runtime/events".to_string()
}

const fn default_lockout_hours() -> i64 {
    24
}

const fn default_idempotency_max_keys() -> usize {
    10_000
}

const fn default_idempotency_ttl_hours() -> i64 {
    24
}
