//! Tick scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::AccountId;
use crate::monitor::MonitorSettings;

/// Tick scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between passes.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Seconds `stop` waits for the loop.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Fixed account list; the broker is asked when absent.
    #[serde(default)]
    pub account_ids: Option<Vec<String>>,
    /// Only monitor active accounts.
    #[serde(default = "default_true")]
    pub active_only: bool,
    /// Record actions without executing them.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            account_ids: None,
            active_only: true,
            dry_run: false,
        }
    }
}

impl MonitorConfig {
    /// Scheduler settings.
    #[must_use]
    pub fn to_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(self.interval_secs),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            account_ids: self
                .account_ids
                .as_ref()
                .map(|ids| ids.iter().map(|id| AccountId::from(id.as_str())).collect()),
            active_only: self.active_only,
        }
    }
}

const fn default_interval_secs() -> u64 {
    30
}

const fn default_stop_timeout_secs() -> u64 {
    5
}

pub(crate) const fn default_true() -> bool {
    true
}
