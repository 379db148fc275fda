//! Per-tier thresholds.

use std::collections::BTreeMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::RiskTier;

/// Errors building or loading a policy table.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// No tiers configured.
    #[error("policy table has no tiers")]
    EmptyTable,

    /// A tier's thresholds are inconsistent.
    #[error("invalid limits for tier {tier}: {reason}")]
    InvalidTier {
        /// Offending tier.
        tier: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Policy document could not be read.
    #[error("failed to read policy file {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Policy document is not valid YAML.
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] serde_yaml_bw::Error),
}

/// Thresholds for one risk tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Daily loss limit (negative).
    pub daily_loss: Decimal,
    /// Maximum total contracts across all symbols.
    pub max_contracts: i64,
    /// Maximum contracts in a single symbol.
    pub max_per_symbol: i64,
    /// Minutes after a news event during which the account is locked.
    pub news_blackout_minutes: i64,
    /// Minutes before session close during which the account is locked.
    pub late_session_minutes: i64,
}

impl TierLimits {
    /// Build a limit set.
    #[must_use]
    pub const fn new(
        daily_loss: Decimal,
        max_contracts: i64,
        max_per_symbol: i64,
        news_blackout_minutes: i64,
        late_session_minutes: i64,
    ) -> Self {
        Self {
            daily_loss,
            max_contracts,
            max_per_symbol,
            news_blackout_minutes,
            late_session_minutes,
        }
    }

    fn validate(&self, tier: &str) -> Result<(), PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidTier {
            tier: tier.to_string(),
            reason: reason.to_string(),
        };

        if self.daily_loss >= Decimal::ZERO {
            return Err(invalid("daily_loss must be negative"));
        }
        if self.max_contracts <= 0 || self.max_per_symbol <= 0 {
            return Err(invalid("contract limits must be positive"));
        }
        if self.max_per_symbol > self.max_contracts {
            return Err(invalid("max_per_symbol exceeds max_contracts"));
        }
        if self.news_blackout_minutes < 0 || self.late_session_minutes < 0 {
            return Err(invalid("window minutes must not be negative"));
        }
        Ok(())
    }

    /// Whether `self` is stricter than `other`: the smaller allowed loss
    /// first, then the smaller contract ceiling.
    fn is_stricter_than(&self, other: &Self) -> bool {
        (self.daily_loss, -self.max_contracts) > (other.daily_loss, -other.max_contracts)
    }
}

/// Read-only tier table used during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, TierLimits>", into = "BTreeMap<String, TierLimits>")]
pub struct PolicyConfig {
    tiers: BTreeMap<String, TierLimits>,
    conservative: (String, TierLimits),
}

impl PolicyConfig {
    /// Build a table, rejecting empty or inconsistent tiers.
    pub fn new(tiers: BTreeMap<String, TierLimits>) -> Result<Self, PolicyError> {
        let mut conservative: Option<(&String, &TierLimits)> = None;
        for (name, limits) in &tiers {
            limits.validate(name)?;
            match conservative {
                Some((_, best)) if !limits.is_stricter_than(best) => {}
                _ => conservative = Some((name, limits)),
            }
        }
        let (name, limits) = conservative.ok_or(PolicyError::EmptyTable)?;
        let conservative = (name.clone(), limits.clone());

        Ok(Self {
            tiers,
            conservative,
        })
    }

    /// Hard-coded table used when no policy document is configured.
    #[must_use]
    pub fn fallback() -> Self {
        let t0 = TierLimits::new(Decimal::new(-150, 0), 1, 1, 30, 30);
        let tiers = BTreeMap::from([
            ("t0".to_string(), t0.clone()),
            (
                "t1".to_string(),
                TierLimits::new(Decimal::new(-300, 0), 2, 2, 20, 20),
            ),
            (
                "t2".to_string(),
                TierLimits::new(Decimal::new(-600, 0), 4, 3, 30, 15),
            ),
        ]);
        Self {
            tiers,
            conservative: ("t0".to_string(), t0),
        }
    }

    /// Load a YAML document mapping tier name to thresholds.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path).map_err(|e| PolicyError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a YAML document mapping tier name to thresholds.
    pub fn from_yaml(content: &str) -> Result<Self, PolicyError> {
        let tiers: BTreeMap<String, TierLimits> = serde_yaml_bw::from_str(content)?;
        Self::new(tiers)
    }

    /// Thresholds for `tier`, falling back to the most conservative tier
    /// when the name is not configured. Returns the tier name actually used.
    #[must_use]
    pub fn limits_for(&self, tier: &RiskTier) -> (&str, &TierLimits) {
        if let Some((name, limits)) = self.tiers.get_key_value(tier.as_str()) {
            return (name, limits);
        }
        self.most_conservative()
    }

    /// Strictest configured tier.
    #[must_use]
    pub fn most_conservative(&self) -> (&str, &TierLimits) {
        (&self.conservative.0, &self.conservative.1)
    }

    /// Whether a tier name is configured.
    #[must_use]
    pub fn contains(&self, tier: &str) -> bool {
        self.tiers.contains_key(tier)
    }

    /// Iterate tiers in name order.
    pub fn tiers(&self) -> impl Iterator<Item = (&str, &TierLimits)> {
        self.tiers.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::fallback()
    }
}

impl TryFrom<BTreeMap<String, TierLimits>> for PolicyConfig {
    type Error = PolicyError;

    fn try_from(tiers: BTreeMap<String, TierLimits>) -> Result<Self, Self::Error> {
        Self::new(tiers)
    }
}

impl From<PolicyConfig> for BTreeMap<String, TierLimits> {
    fn from(config: PolicyConfig) -> Self {
        config.tiers
    }
}
