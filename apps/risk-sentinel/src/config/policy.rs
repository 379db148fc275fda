//! Policy tier table and account-to-tier mapping.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::models::{AccountId, RiskTier};
use crate::monitor::TierAssignments;
use crate::policy::{PolicyConfig, TierLimits};

/// Policy section.
///
/// Tiers come from `tiers` when present, otherwise from the document at
/// `path`, otherwise from the built-in table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Inline tier table.
    #[serde(default)]
    pub tiers: Option<BTreeMap<String, TierLimits>>,
    /// Separate policy document.
    #[serde(default)]
    pub path: Option<String>,
    /// Account ID to tier name.
    #[serde(default)]
    pub account_tiers: HashMap<String, String>,
    /// Tier for accounts not listed in `account_tiers`.
    #[serde(default = "default_tier")]
    pub default_tier: String,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            tiers: None,
            path: None,
            account_tiers: HashMap::new(),
            default_tier: default_tier(),
        }
    }
}

impl PolicySection {
    /// Resolve the tier table.
    pub fn to_policy_config(&self) -> Result<PolicyConfig, ConfigError> {
        if let Some(tiers) = &self.tiers {
            return PolicyConfig::new(tiers.clone())
                .map_err(|e| ConfigError::ValidationError(format!("policy.tiers: {e}")));
        }
        if let Some(path) = &self.path {
            return PolicyConfig::load(Path::new(path))
                .map_err(|e| ConfigError::ValidationError(format!("policy.path: {e}")));
        }
        Ok(PolicyConfig::fallback())
    }

    /// Account-to-tier mapping.
    #[must_use]
    pub fn tier_assignments(&self) -> TierAssignments {
        let by_account = self
            .account_tiers
            .iter()
            .map(|(account, tier)| (AccountId::from(account.as_str()), RiskTier::from(tier.as_str())))
            .collect();
        TierAssignments::new(by_account, RiskTier::from(self.default_tier.as_str()))
    }
}

fn default_tier() -> String {
    "t0".to_string()
}
