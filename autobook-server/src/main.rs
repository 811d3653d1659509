//! # Autobook Server
//!
//! Entry point for the monitor. `serve` (the default) exposes the HTTP
//! trigger and, unless disabled, runs the monitor on an interval. `run`
//! performs a single run and prints its outcome as JSON.

use std::path::PathBuf;

use anyhow::Context;
use autobook_config::{Config, ConfigLoad, ConfigLoader};
use autobook_core::worker::{RunOptions, RunStatus};
use autobook_server::{
    AppState,
    infra::{
        bootstrap::{build_worker, run_migrations},
        scheduler::spawn_interval_runs,
        telemetry::init_tracing,
    },
    routes::create_router,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "autobook-server")]
#[command(about = "Lock-guarded booking monitor for expired work items")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "AUTOBOOK_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Serve the HTTP trigger only; do not run on an interval
    #[arg(long, default_value_t = false)]
    no_schedule: bool,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Log the intended action per item without executing it
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Process at most this many items
    #[arg(long)]
    max_items: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP trigger (default)
    Serve(ServeArgs),
    /// Perform one monitor run and print the outcome
    Run(RunArgs),
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;

    match cli.command {
        Some(Command::Db(DbCommand::Migrate)) => run_migrations(&config).await,
        Some(Command::Run(args)) => run_once(&config, args).await,
        Some(Command::Serve(args)) => run_server(config, args).await,
        None => run_server(config, cli.serve).await,
    }
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }

    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;

    init_tracing();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }

    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }

    Ok(config)
}

async fn run_once(config: &Config, args: RunArgs) -> anyhow::Result<()> {
    if args.max_items == Some(0) {
        anyhow::bail!("--max-items must be at least 1");
    }
    let bootstrap = build_worker(config).await?;
    if !args.dry_run && !bootstrap.executor_configured {
        anyhow::bail!(
            "BOOKING_TRIGGER_URL is not configured; use --dry-run or configure the booking trigger"
        );
    }

    let outcome = bootstrap
        .worker
        .run(RunOptions {
            dry_run: args.dry_run,
            max_items: args.max_items,
        })
        .await;

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome)
            .context("failed to serialize run outcome")?
    );

    match outcome.status {
        RunStatus::Completed | RunStatus::LockBusy => Ok(()),
        status => {
            error!(?status, "monitor run did not complete");
            Err(anyhow::anyhow!("monitor run ended with status {status:?}"))
        }
    }
}

async fn run_server(mut config: Config, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let bootstrap = build_worker(&config).await?;
    if !bootstrap.executor_configured {
        warn!("No BOOKING_TRIGGER_URL configured - only dry runs will be accepted");
    }

    let shutdown = CancellationToken::new();
    let scheduler = if config.schedule.enabled && !args.no_schedule {
        if bootstrap.executor_configured {
            Some(spawn_interval_runs(
                bootstrap.worker.clone(),
                config.schedule.interval,
                shutdown.clone(),
            ))
        } else {
            warn!("interval schedule disabled: booking trigger is not configured");
            None
        }
    } else {
        info!("interval schedule disabled; waiting for external triggers");
        None
    };

    let state = AppState::new(bootstrap.worker, bootstrap.executor_configured);
    let app = create_router(state);

    let addr = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("shutdown signal received");
        signal_token.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(handle) = scheduler
        && let Err(e) = handle.await
    {
        error!("scheduler task failed: {}", e);
    }

    Ok(())
}
