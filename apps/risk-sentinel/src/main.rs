//! Risk Sentinel Binary
//!
//! Drives the risk control loop against the configured broker.
//!
//! # Usage
//!
//! ```bash
//! risk-sentinel tick --count 3 --interval-secs 10
//! risk-sentinel run
//! risk-sentinel status
//! risk-sentinel lockout show ACC-1
//! risk-sentinel lockout clear ACC-1
//! risk-sentinel evaluate --context context.json
//! ```
//!
//! # Environment Variables
//!
//! - `RISK_SENTINEL_CONFIG`: config file path (default: config.yaml)
//! - `PROJECTX_USERNAME`, `PROJECTX_API_KEY`: referenced from the config via `${VAR}`
//! - `RUST_LOG`: overrides `logging.level`
//!
//! # Exit Codes
//!
//! - 0: completed
//! - 130: interrupted before the requested ticks completed
//! - 1: any other error

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use risk_sentinel::broker::{
    BrokerClient, GuardedBroker, ProjectXClient, RateLimiter, RetryExecutor, SimulatedBroker,
};
use risk_sentinel::config::{BrokerMode, Config, load_config};
use risk_sentinel::enforcement::Enforcer;
use risk_sentinel::models::{AccountId, EvaluationContext};
use risk_sentinel::monitor::{ContextBuilder, RiskMonitor, TickEventLog};
use risk_sentinel::observability::{init_metrics, init_tracing};
use risk_sentinel::policy::PolicyBrain;
use risk_sentinel::safety::{IdempotencyStore, LockoutStore};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Conventional exit status for SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "risk-sentinel", about = "Autonomous risk control for funded futures accounts")]
struct Cli {
    /// Config file (falls back to $RISK_SENTINEL_CONFIG, then config.yaml).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Record permitted actions without touching the broker.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bounded number of monitor passes.
    Tick {
        /// Passes to run.
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Seconds between passes (default: monitor.interval_secs).
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Run the monitor loop until interrupted.
    Run,

    /// Run one pass and print the monitor status as JSON.
    Status,

    /// Inspect or clear account lockouts.
    Lockout {
        #[command(subcommand)]
        cmd: LockoutCmd,
    },

    /// Evaluate the policy against a context file and print the plan.
    Evaluate {
        /// JSON-encoded evaluation context.
        #[arg(long)]
        context: PathBuf,
    },
}

#[derive(Subcommand)]
enum LockoutCmd {
    /// Show one account's lockout, or every stored lockout.
    Show { account: Option<String> },
    /// Remove an account's lockout.
    Clear { account: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    load_dotenv();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "risk-sentinel failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging).context("failed to initialize logging")?;
    if let Some(addr) = config.observability.metrics_addr {
        init_metrics(addr).context("failed to start metrics exporter")?;
    }
    let dry_run = cli.dry_run || config.monitor.dry_run;
    log_config(&config, dry_run);

    match cli.cmd {
        Commands::Tick {
            count,
            interval_secs,
        } => {
            let interval =
                Duration::from_secs(interval_secs.unwrap_or(config.monitor.interval_secs));
            run_ticks(&config, dry_run, count, interval).await
        }
        Commands::Run => run_loop(&config, dry_run).await,
        Commands::Status => print_status(&config, dry_run).await,
        Commands::Lockout { cmd } => lockout(&config, cmd),
        Commands::Evaluate { context } => evaluate(&config, &context),
    }
}

async fn run_ticks(config: &Config, dry_run: bool, count: u32, interval: Duration) -> Result<ExitCode> {
    let monitor = create_monitor(config, dry_run)?;
    let cancel = CancellationToken::new();
    let watcher = spawn_interrupt_watcher(cancel.clone());

    let report = monitor
        .run_ticks(count, interval, &cancel)
        .await
        .context("tick run failed")?;
    watcher.abort();

    tracing::info!(
        requested = report.requested,
        completed = report.completed,
        interrupted = report.interrupted,
        "Tick run finished"
    );

    if report.interrupted {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_loop(config: &Config, dry_run: bool) -> Result<ExitCode> {
    let monitor = create_monitor(config, dry_run)?;
    monitor.start().await.context("failed to start monitor")?;

    shutdown_signal().await;

    let stopped = monitor.stop().await.context("monitor did not stop cleanly")?;
    let status = monitor.status();
    tracing::info!(
        stopped,
        ticks = status.ticks,
        evaluations = status.evaluations,
        actions = status.actions,
        "Monitor shut down"
    );
    Ok(ExitCode::SUCCESS)
}

async fn print_status(config: &Config, dry_run: bool) -> Result<ExitCode> {
    let monitor = create_monitor(config, dry_run)?;
    let cancel = CancellationToken::new();
    monitor
        .run_ticks(1, Duration::ZERO, &cancel)
        .await
        .context("status pass failed")?;

    let json = serde_json::to_string_pretty(&monitor.status())?;
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}

fn lockout(config: &Config, cmd: LockoutCmd) -> Result<ExitCode> {
    let store = create_lockout_store(config)?;
    match cmd {
        LockoutCmd::Show { account: Some(account) } => {
            match store.get(&AccountId::from(account.as_str()))? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("{account}: no active lockout"),
            }
        }
        LockoutCmd::Show { account: None } => {
            let records = store.list()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        LockoutCmd::Clear { account } => {
            if store.clear(&AccountId::from(account.as_str()))? {
                println!("{account}: lockout cleared");
            } else {
                println!("{account}: no lockout to clear");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn evaluate(config: &Config, path: &Path) -> Result<ExitCode> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read context file {}", path.display()))?;
    let ctx: EvaluationContext = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid evaluation context", path.display()))?;

    let brain = PolicyBrain::new(config.policy.to_policy_config()?);
    let plan = brain.evaluate(&ctx);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(ExitCode::SUCCESS)
}

fn create_broker(config: &Config) -> Result<Arc<dyn BrokerClient>> {
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.to_rate_limit_config()));
    let retry = RetryExecutor::new(config.retry.to_retry_policy());
    let breaker = config.circuit_breaker.to_resilience_config();

    let broker: Arc<dyn BrokerClient> = match config.broker.mode {
        BrokerMode::Simulated => {
            tracing::warn!("Using simulated broker; no real orders will be sent");
            Arc::new(GuardedBroker::new(SimulatedBroker::demo(), limiter, retry, &breaker))
        }
        BrokerMode::Projectx => {
            if !config.broker.has_credentials() {
                bail!("broker.username and broker.api_key are required in projectx mode");
            }
            let client = ProjectXClient::new(config.broker.to_projectx_config())
                .context("failed to create ProjectX client")?;
            Arc::new(GuardedBroker::new(client, limiter, retry, &breaker))
        }
    };
    Ok(broker)
}

fn create_lockout_store(config: &Config) -> Result<LockoutStore> {
    LockoutStore::open(&config.storage.lockout_dir, config.storage.lockout_duration())
        .with_context(|| format!("failed to open lockout store at {}", config.storage.lockout_dir))
}

fn create_monitor(config: &Config, dry_run: bool) -> Result<RiskMonitor> {
    let broker = create_broker(config)?;
    let lockouts = Arc::new(create_lockout_store(config)?);
    let idempotency = Arc::new(
        IdempotencyStore::open(&config.storage.idempotency_path, config.storage.idempotency())
            .with_context(|| {
                format!(
                    "failed to open idempotency table at {}",
                    config.storage.idempotency_path
                )
            })?,
    );
    let policy = config.policy.to_policy_config()?;

    let session = config
        .session
        .as_ref()
        .map(|s| s.to_trading_session())
        .transpose()?;
    let context = ContextBuilder::new(Arc::clone(&broker), Arc::clone(&lockouts), config.policy.tier_assignments())
        .with_session(session)
        .with_news(config.news.to_calendar());

    let enforcer = Enforcer::new(Arc::clone(&broker), lockouts, idempotency).with_dry_run(dry_run);
    let events = TickEventLog::open(&config.storage.events_dir)
        .with_context(|| format!("failed to open event log at {}", config.storage.events_dir))?;

    Ok(RiskMonitor::new(
        broker,
        context,
        PolicyBrain::new(policy),
        enforcer,
        events,
        config.monitor.to_settings(),
    ))
}

fn log_config(config: &Config, dry_run: bool) {
    tracing::info!(
        broker = ?config.broker.mode,
        interval_secs = config.monitor.interval_secs,
        accounts = ?config.monitor.account_ids,
        lockout_dir = %config.storage.lockout_dir,
        idempotency_path = %config.storage.idempotency_path,
        events_dir = %config.storage.events_dir,
        dry_run,
        "Risk sentinel configured"
    );
    if dry_run {
        tracing::warn!("Dry-run mode: actions are recorded but not executed");
    }
}

/// Load .env from the current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Cancel `token` on the first shutdown signal.
fn spawn_interrupt_watcher(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    })
}

/// Wait for SIGINT or SIGTERM. If a handler cannot be installed, that branch
/// never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
