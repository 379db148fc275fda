//! The tick loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ContextBuilder, MonitorError, TickEvent, TickEventLog};
use crate::broker::BrokerClient;
use crate::enforcement::{ActionStatus, Enforcer};
use crate::models::AccountId;
use crate::observability::{record_evaluation, record_tick, update_monitored_accounts};
use crate::policy::PolicyBrain;

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Sleep between passes.
    pub interval: Duration,
    /// How long `stop` waits for the loop to exit.
    pub stop_timeout: Duration,
    /// Fixed account set; resolved from the broker when `None`.
    pub account_ids: Option<Vec<AccountId>>,
    /// Only monitor active accounts when resolving from the broker.
    pub active_only: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            account_ids: None,
            active_only: true,
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    /// Whether the background loop is running.
    pub running: bool,
    /// Monitored accounts in processing order.
    pub accounts: Vec<AccountId>,
    /// Completed passes.
    pub ticks: u64,
    /// Policy evaluations.
    pub evaluations: u64,
    /// Actions sent to the broker or lockout store.
    pub actions: u64,
    /// Account cycles skipped because of an error.
    pub errors: u64,
    /// Actionable plans per account.
    pub violations: BTreeMap<AccountId, u64>,
}

/// Result of a bounded [`RiskMonitor::run_ticks`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Passes requested.
    pub requested: u32,
    /// Passes completed.
    pub completed: u32,
    /// Whether cancellation cut the run short.
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct Stats {
    running: AtomicBool,
    ticks: AtomicU64,
    evaluations: AtomicU64,
    actions: AtomicU64,
    errors: AtomicU64,
    accounts: RwLock<Vec<AccountId>>,
    violations: Mutex<BTreeMap<AccountId, u64>>,
}

/// Everything one account cycle needs.
struct TickRunner {
    context: ContextBuilder,
    brain: PolicyBrain,
    enforcer: Enforcer,
    events: TickEventLog,
    stats: Stats,
}

impl TickRunner {
    /// One pass over `accounts` in order. Returns the number of accounts
    /// whose cycle failed.
    async fn run_pass(&self, accounts: &[AccountId], cancel: &CancellationToken) -> usize {
        let started = Instant::now();
        let mut failed = 0;
        let mut processed = 0;

        for account in accounts {
            if cancel.is_cancelled() {
                tracing::info!(processed, "Pass cancelled between accounts");
                break;
            }
            processed += 1;
            if let Err(e) = self.process_account(account).await {
                failed += 1;
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(account_id = %account, error = %e, "Account tick failed, continuing");
                self.write_event(&TickEvent::skipped(account, &e));
            }
        }

        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        record_tick(started.elapsed().as_secs_f64(), processed, failed);
        tracing::debug!(
            accounts = processed,
            failed,
            elapsed_ms = started.elapsed().as_millis(),
            "Pass complete"
        );
        failed
    }

    async fn process_account(&self, account: &AccountId) -> Result<(), MonitorError> {
        let ctx = self.context.build(account).await?;
        let plan = self.brain.evaluate(&ctx);
        self.stats.evaluations.fetch_add(1, Ordering::Relaxed);
        record_evaluation(plan.policy().unwrap_or("unknown"));

        let actionable = plan.is_actionable();
        if actionable {
            *self.stats.violations.lock().entry(account.clone()).or_insert(0) += 1;
        }

        let result = self.enforcer.apply(account, &plan).await;
        if actionable {
            let sent = result.executed_actions() + result.count(ActionStatus::DryRun);
            self.stats.actions.fetch_add(sent as u64, Ordering::Relaxed);
        }

        tracing::debug!(
            account_id = %account,
            correlation_id = %plan.correlation_id,
            policy = plan.policy().unwrap_or("unknown"),
            day_pnl = %ctx.day_pnl,
            disposition = ?result.disposition,
            "Account tick complete"
        );
        self.write_event(&TickEvent::completed(&ctx, &plan, &result));
        Ok(())
    }

    fn write_event(&self, event: &TickEvent) {
        if let Err(e) = self.events.append(event) {
            tracing::error!(
                account_id = %event.account_id,
                correlation_id = %event.correlation_id,
                error = %e,
                "Failed to write tick event"
            );
        }
    }
}

/// Drives evaluate, enforce and log for every monitored account.
///
/// The loop runs on one background task. Cancellation is cooperative: it is
/// observed between accounts and during the inter-tick sleep, never inside a
/// broker call.
pub struct RiskMonitor {
    broker: Arc<dyn BrokerClient>,
    runner: Arc<TickRunner>,
    settings: MonitorSettings,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for RiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskMonitor")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RiskMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        context: ContextBuilder,
        brain: PolicyBrain,
        enforcer: Enforcer,
        events: TickEventLog,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            broker,
            runner: Arc::new(TickRunner {
                context,
                brain,
                enforcer,
                events,
                stats: Stats::default(),
            }),
            settings,
            task: Mutex::new(None),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Event log.
    #[must_use]
    pub fn events(&self) -> &TickEventLog {
        &self.runner.events
    }

    /// Whether the background loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.runner.stats.running.load(Ordering::SeqCst)
    }

    /// Resolve the accounts to monitor, in stable order.
    pub async fn resolve_accounts(&self) -> Result<Vec<AccountId>, MonitorError> {
        let mut accounts = match &self.settings.account_ids {
            Some(ids) => ids.clone(),
            None => self.broker.get_accounts(self.settings.active_only).await?,
        };
        accounts.sort();
        accounts.dedup();
        if accounts.is_empty() {
            return Err(MonitorError::NoAccounts);
        }

        update_monitored_accounts(accounts.len());
        *self.runner.stats.accounts.write() = accounts.clone();
        Ok(accounts)
    }

    /// Start the background loop.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if the loop is live; `NoAccounts` or `Broker` if the
    /// account set cannot be resolved.
    pub async fn start(&self) -> Result<(), MonitorError> {
        {
            let mut task = self.task.lock();
            if task.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
                return Err(MonitorError::AlreadyRunning);
            }
            *task = None;
        }

        if self
            .runner
            .stats
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MonitorError::AlreadyRunning);
        }

        let accounts = match self.resolve_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                self.runner.stats.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let runner = Arc::clone(&self.runner);
        let interval = self.settings.interval;
        let token = cancel.clone();

        tracing::info!(
            accounts = accounts.len(),
            interval_secs = interval.as_secs(),
            "Starting risk monitor"
        );

        let handle = tokio::spawn(async move {
            loop {
                runner.run_pass(&accounts, &token).await;
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            runner.stats.running.store(false, Ordering::SeqCst);
            tracing::info!("Risk monitor loop ended");
        });

        *self.task.lock() = Some((cancel, handle));
        Ok(())
    }

    /// Signal the loop to stop and wait up to the stop timeout for it to
    /// exit. Returns `false` if it was not running.
    ///
    /// A loop that outlives the timeout stays registered and keeps the
    /// monitor running: `start` refuses until it has drained, and a later
    /// `stop` waits for it again.
    ///
    /// # Errors
    ///
    /// `StopTimeout` if the loop is still inside a broker call when the
    /// timeout elapses; `Join` if the task panicked.
    pub async fn stop(&self) -> Result<bool, MonitorError> {
        let Some((cancel, mut handle)) = self.task.lock().take() else {
            return Ok(false);
        };

        tracing::info!("Stopping risk monitor");
        cancel.cancel();

        match tokio::time::timeout(self.settings.stop_timeout, &mut handle).await {
            Ok(joined) => {
                self.runner.stats.running.store(false, Ordering::SeqCst);
                joined
                    .map(|()| true)
                    .map_err(|e| MonitorError::Join(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.settings.stop_timeout.as_millis(),
                    "Risk monitor did not stop in time, loop still draining"
                );
                *self.task.lock() = Some((cancel, handle));
                Err(MonitorError::StopTimeout(self.settings.stop_timeout))
            }
        }
    }

    /// Run exactly `count` passes in the caller's task, sleeping `interval`
    /// between them. Stops early when `cancel` fires.
    pub async fn run_ticks(
        &self,
        count: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<TickReport, MonitorError> {
        let accounts = self.resolve_accounts().await?;
        let mut report = TickReport {
            requested: count,
            completed: 0,
            interrupted: false,
        };

        for n in 0..count {
            if cancel.is_cancelled() {
                break;
            }
            self.runner.run_pass(&accounts, cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            report.completed += 1;

            if n + 1 < count {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }

        report.interrupted = report.completed < count;
        Ok(report)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        let stats = &self.runner.stats;
        MonitorStatus {
            running: stats.running.load(Ordering::SeqCst),
            accounts: stats.accounts.read().clone(),
            ticks: stats.ticks.load(Ordering::Relaxed),
            evaluations: stats.evaluations.load(Ordering::Relaxed),
            actions: stats.actions.load(Ordering::Relaxed),
            errors: stats.errors.load(Ordering::Relaxed),
            violations: stats.violations.lock().clone(),
        }
    }
}
