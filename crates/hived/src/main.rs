//! hived - blackboard work orchestrator daemon.
//!
//! Entry points: `tick` for an external timer, `run` for loop mode, and
//! `worker` as the detached per-item process spawned by the dispatcher.

use clap::{Args, Parser, Subcommand};
use hive_core::Config;
use hived::dispatch::{DispatchOptions, Dispatcher};
use hived::worker::Worker;
use mimalloc::MiMalloc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "hived")]
#[command(about = "Blackboard work orchestrator for coding agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct TickArgs {
    /// Maximum live worker sessions before dispatch skips.
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,

    /// Maximum items dispatched per tick.
    #[arg(long, default_value_t = 1)]
    max_items: usize,

    /// Priority filter, e.g. "P1" or "P1,P2".
    #[arg(long)]
    priority: Option<String>,

    /// Restrict dispatch to one project.
    #[arg(long)]
    project: Option<String>,

    /// Report what would be dispatched without claiming anything.
    #[arg(long)]
    dry_run: bool,

    /// Per-item agent budget in minutes.
    #[arg(long, default_value_t = 30)]
    timeout_min: u64,

    /// Spawn detached worker processes instead of running inline.
    #[arg(long)]
    fire_and_forget: bool,
}

impl TickArgs {
    fn to_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_concurrent: self.max_concurrent,
            max_items: self.max_items,
            priority: self.priority.clone(),
            project: self.project.clone(),
            dry_run: self.dry_run,
            timeout_min: self.timeout_min,
            fire_and_forget: self.fire_and_forget,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// One dispatcher + SpecFlow tick (for an external timer).
    Tick {
        #[command(flatten)]
        args: TickArgs,
    },

    /// Loop mode: sweep and tick on an interval until interrupted.
    Run {
        #[command(flatten)]
        args: TickArgs,

        /// Seconds between ticks.
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },

    /// Detached worker entry point (spawned by the dispatcher).
    Worker {
        /// Session that claimed the item.
        #[arg(long)]
        session_id: String,

        /// Work item to execute.
        #[arg(long)]
        item_id: String,

        /// Agent launch budget in milliseconds.
        #[arg(long)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let cli = Cli::parse();
    let exit = match cli.command {
        Command::Tick { args } => run_tick(config, &args, true).await,
        Command::Run {
            args,
            interval_secs,
        } => run_loop(config, &args, interval_secs).await,
        Command::Worker {
            session_id,
            item_id,
            timeout_ms,
        } => run_worker(config, &session_id, &item_id, timeout_ms).await,
    };
    std::process::exit(exit);
}

async fn run_tick(config: Config, args: &TickArgs, startup: bool) -> i32 {
    match tick_once(config, args, startup).await {
        Ok(()) => 0,
        Err(e) => {
            error!("tick failed: {e:#}");
            1
        }
    }
}

async fn tick_once(config: Config, args: &TickArgs, startup: bool) -> hived::AppResult<()> {
    let env = hived::build_env(config).await?;
    let orchestrator = hived::build_orchestrator(&env);
    if startup {
        orchestrator.startup_release().await?;
    }

    let session_id = hived::register_tick_session(&env).await?;
    let swept = env.registry.sweep_stale().await?;
    if !swept.is_empty() {
        info!(swept = swept.len(), "swept stale sessions");
    }

    let dispatcher = Dispatcher::new(std::sync::Arc::clone(&env));
    let result = dispatcher.run(&args.to_options()).await?;
    info!(
        dispatched = result.dispatched.len(),
        skipped = result.skipped.len(),
        errors = result.errors.len(),
        dry_run = result.dry_run,
        "dispatch tick finished"
    );
    for skipped in &result.skipped {
        info!(item_id = %skipped.item_id, reason = %skipped.reason, "skipped");
    }

    let report = orchestrator.tick(&session_id, args.max_concurrent).await?;
    info!(
        advanced = report.features_advanced,
        phases = report.phases_run,
        gates = report.gates_checked,
        released = report.released,
        failed = report.failed,
        "specflow tick finished"
    );

    env.registry.deregister(&session_id).await?;
    Ok(())
}

async fn run_loop(config: Config, args: &TickArgs, interval_secs: u64) -> i32 {
    let mut first = true;
    loop {
        let code = run_tick(config.clone(), args, first).await;
        if code != 0 {
            error!("tick exited with {code}; continuing after backoff");
        }
        first = false;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT; stopping");
                return 0;
            }
        }
    }
}

async fn run_worker(config: Config, session_id: &str, item_id: &str, timeout_ms: u64) -> i32 {
    info!(session_id, item_id, timeout_ms, "worker starting");
    let env = match hived::build_env(config).await {
        Ok(env) => env,
        Err(e) => {
            error!("worker could not open store: {e:#}");
            return 1;
        }
    };
    let worker = Worker::new(env, session_id, Duration::from_millis(timeout_ms));
    match worker.run(item_id).await {
        Ok(()) => 0,
        Err(e) => {
            error!("worker failed: {e:#}");
            1
        }
    }
}
