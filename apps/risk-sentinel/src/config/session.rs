//! Trading session and news calendar.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::monitor::{NewsCalendar, TradingSession};

/// Trading session hours (`HH:MM`, local to `timezone`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// IANA time zone name.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Session open.
    #[serde(default = "default_open")]
    pub open: String,
    /// Session close.
    #[serde(default = "default_close")]
    pub close: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            open: default_open(),
            close: default_close(),
        }
    }
}

impl SessionConfig {
    /// Parse into a [`TradingSession`].
    pub fn to_trading_session(&self) -> Result<TradingSession, ConfigError> {
        let tz: Tz = self.timezone.parse().map_err(|_| {
            ConfigError::ValidationError(format!("session.timezone: unknown zone {}", self.timezone))
        })?;
        let open = parse_hhmm("session.open", &self.open)?;
        let close = parse_hhmm("session.close", &self.close)?;
        TradingSession::new(tz, open, close).ok_or_else(|| {
            ConfigError::ValidationError("session.close must be after session.open".to_string())
        })
    }
}

fn parse_hhmm(field: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|e| ConfigError::ValidationError(format!("{field}: {value:?} is not HH:MM ({e})")))
}

/// Scheduled news events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsConfig {
    /// Event times (RFC 3339).
    #[serde(default)]
    pub events: Vec<DateTime<Utc>>,
}

impl NewsConfig {
    /// Sorted calendar.
    #[must_use]
    pub fn to_calendar(&self) -> NewsCalendar {
        NewsCalendar::new(self.events.clone())
    }
}

fn default_timezone() -> String {
    "America/Chicago".to_string()
}

fn default_open() -> String {
    "08:30".to_string()
}

fn default_close() -> String {
    "15:00".to_string()
}
