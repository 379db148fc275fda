//! Broker connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::ProjectXConfig;

/// Which [`BrokerClient`](crate::broker::BrokerClient) to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// In-memory demo broker.
    #[default]
    Simulated,
    /// ProjectX gateway over HTTP.
    Projectx,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Client selection.
    #[serde(default)]
    pub mode: BrokerMode,
    /// API root.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Login user name.
    #[serde(default)]
    pub username: String,
    /// API key.
    #[serde(default)]
    pub api_key: String,
    /// TCP connect timeout (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-request timeout (milliseconds).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::default(),
            base_url: default_base_url(),
            username: String::new(),
            api_key: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl BrokerConfig {
    /// Whether credentials are present.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.api_key.is_empty()
    }

    /// HTTP client settings.
    #[must_use]
    pub fn to_projectx_config(&self) -> ProjectXConfig {
        ProjectXConfig {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            username: self.username.clone(),
            api_key: self.api_key.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

fn default_base_url() -> String {
    "https://gateway-api-demo.s2f.projectx.com".to_string()
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}
