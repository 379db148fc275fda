//! Tick scheduler and its inputs.
//!
//! - [`ContextBuilder`]: one [`EvaluationContext`](crate::models::EvaluationContext) per account per tick
//! - [`RiskMonitor`]: build, evaluate, enforce and log for every account on a cadence
//! - [`TickEventLog`]: append-only JSONL record of each account tick

mod context;
mod event_log;
mod scheduler;
mod session;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use context::{ContextBuilder, TierAssignments};
pub use event_log::{ContextSummary, TickEvent, TickEventLog};
pub use scheduler::{MonitorSettings, MonitorStatus, RiskMonitor, TickReport};
pub use session::{NewsCalendar, TradingSession};

use crate::broker::BrokerError;

/// Tick scheduler errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// `start` called while the loop is running.
    #[error("monitor is already running")]
    AlreadyRunning,

    /// No accounts resolved for monitoring.
    #[error("no accounts to monitor")]
    NoAccounts,

    /// Broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Event log I/O failure.
    #[error("event log I/O error at {path}: {source}")]
    EventLog {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Event could not be serialized.
    #[error("event encode failed: {0}")]
    EventEncode(#[source] serde_json::Error),

    /// The loop did not exit within the stop timeout.
    #[error("monitor did not stop within {0:?}")]
    StopTimeout(Duration),

    /// The loop task panicked or was aborted.
    #[error("monitor task failed: {0}")]
    Join(String),
}
