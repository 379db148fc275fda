//! Append-only JSONL record of every account tick.
//!
//! One file per UTC day, `events-YYYYMMDD.jsonl`.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MonitorError;
use crate::enforcement::EnforcementResult;
use crate::models::{AccountId, Action, ActionPlan, EvaluationContext, RiskTier};

/// Summary of the context a decision was made on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    /// Day P&L.
    pub day_pnl: Decimal,
    /// Lowest day P&L today.
    pub max_drawdown_today: Decimal,
    /// Tier.
    pub risk_tier: RiskTier,
    /// Open positions.
    pub positions: usize,
    /// Total absolute contracts.
    pub contracts: i64,
    /// Open orders.
    pub orders: usize,
    /// Lockout flag at evaluation time.
    pub lockout_active: bool,
}

impl From<&EvaluationContext> for ContextSummary {
    fn from(ctx: &EvaluationContext) -> Self {
        Self {
            day_pnl: ctx.day_pnl,
            max_drawdown_today: ctx.max_drawdown_today,
            risk_tier: ctx.risk_tier.clone(),
            positions: ctx.positions.len(),
            contracts: ctx.total_contracts(),
            orders: ctx.orders.len(),
            lockout_active: ctx.env.lockout_active,
        }
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    /// Plan correlation ID, or a fresh ID when no plan was made.
    pub correlation_id: Uuid,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Account.
    pub account_id: AccountId,
    /// Context summary, absent when the context could not be built.
    #[serde(default)]
    pub context: Option<ContextSummary>,
    /// Rule that fired.
    #[serde(default)]
    pub policy: Option<String>,
    /// Planned actions.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Enforcement outcome.
    #[serde(default)]
    pub enforcement: Option<EnforcementResult>,
    /// Why the account's tick was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TickEvent {
    /// Event for a completed evaluate-and-enforce cycle.
    #[must_use]
    pub fn completed(ctx: &EvaluationContext, plan: &ActionPlan, result: &EnforcementResult) -> Self {
        Self {
            correlation_id: plan.correlation_id,
            timestamp: ctx.timestamp,
            account_id: ctx.account_id.clone(),
            context: Some(ContextSummary::from(ctx)),
            policy: plan.policy().map(str::to_string),
            actions: plan.actions.clone(),
            enforcement: Some(result.clone()),
            error: None,
        }
    }

    /// Event for an account whose tick was skipped.
    #[must_use]
    pub fn skipped(account: &AccountId, error: impl ToString) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            account_id: account.clone(),
            context: None,
            policy: None,
            actions: Vec::new(),
            enforcement: None,
            error: Some(error.to_string()),
        }
    }
}

/// Daily-rotated JSONL event sink.
#[derive(Debug)]
pub struct TickEventLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TickEventLog {
    /// Open (creating if needed) a log rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, MonitorError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| MonitorError::EventLog {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding events for `day`.
    #[must_use]
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("events-{}.jsonl", day.format("%Y%m%d")))
    }

    /// Append `event` to the file for its timestamp's UTC day.
    pub fn append(&self, event: &TickEvent) -> Result<(), MonitorError> {
        let path = self.path_for(event.timestamp.date_naive());
        let mut line = serde_json::to_string(event).map_err(MonitorError::EventEncode)?;
        line.push('\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MonitorError::EventLog {
                path: path.clone(),
                source: e,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|e| MonitorError::EventLog { path, source: e })
    }

    /// All events recorded for `day`. Unparseable lines are skipped with a
    /// warning.
    pub fn read_events(&self, day: NaiveDate) -> Result<Vec<TickEvent>, MonitorError> {
        let path = self.path_for(day);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MonitorError::EventLog { path, source: e }),
        };

        let mut events = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| MonitorError::EventLog {
                path: path.clone(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping malformed event line"
                ),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = TickEventLog::open(dir.path()).unwrap();
        let account = AccountId::from("ACC-1");

        let mut first = TickEvent::skipped(&account, "positions: server error 503");
        first.timestamp = Utc.with_ymd_and_hms(2024, 12, 4, 10, 0, 0).unwrap();
        let mut second = first.clone();
        second.correlation_id = Uuid::new_v4();
        log.append(&first).unwrap();
        log.append(&second).unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 12, 4).unwrap();
        assert!(log.path_for(day).ends_with("events-20241204.jsonl"));
        let events = log.read_events(day).unwrap();
        assert_eq!(events, vec![first, second]);
    }

    #[test]
    fn test_missing_day_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = TickEventLog::open(dir.path()).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(log.read_events(day).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = TickEventLog::open(dir.path()).unwrap();
        let event = TickEvent::skipped(&AccountId::from("ACC-1"), "boom");
        let day = event.timestamp.date_naive();
        fs::write(log.path_for(day), "not json\n").unwrap();
        log.append(&event).unwrap();

        let events = log.read_events(day).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error.as_deref(), Some("boom"));
    }
}
