use std::sync::Arc;

use anyhow::Context;
use cadence_core::{CadenceConfig, TracingSink};
use cadence_scheduler::JobScheduler;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod jobs;

use jobs::JobFactory;

#[derive(Parser)]
#[command(name = "cadence-daemon")]
#[command(about = "Cron-style job runner with retries and circuit breaking")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CADENCE_GIT_SHA"), ")"))]
struct Cli {
    /// Config file. Falls back to $CADENCE_CONFIG, then ~/.cadence/cadence.toml
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured jobs until interrupted
    Run,
    /// Validate every configured job and print its next run
    Check {
        /// Print job snapshots as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_daemon=info,cadence_scheduler=info,cadence_resilience=info,cadence::events=info"
                    .into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    // explicit flag > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());

    let config = load_config(config_path.as_deref())?;
    match cli.command {
        Commands::Run => run(config).await,
        Commands::Check { json } => check(&config, json),
    }
}

/// Both commands refuse to start on a config that fails to load, rather than
/// running with defaults and silently dropping the configured jobs.
fn load_config(path: Option<&str>) -> anyhow::Result<CadenceConfig> {
    CadenceConfig::load(path).context("loading configuration")
}

async fn run(config: CadenceConfig) -> anyhow::Result<()> {
    let factory = JobFactory::from_config(&config)?;
    let mut scheduler =
        JobScheduler::new(Arc::new(TracingSink)).with_overlap(config.scheduler.overlap);
    for job in &config.jobs {
        factory.register(&mut scheduler, job)?;
    }
    if scheduler.is_empty() {
        warn!("no jobs configured, the daemon will only emit heartbeats");
    }

    info!(
        jobs = scheduler.len(),
        overlap = ?scheduler.overlap(),
        heartbeat_secs = config.scheduler.heartbeat().as_secs(),
        "cadence daemon starting"
    );
    scheduler
        .run_until(shutdown_signal(), config.scheduler.heartbeat())
        .await?;

    for stats in factory.breakers().stats() {
        info!(
            circuit = %stats.name,
            state = %stats.state,
            failures = stats.failure_count,
            "circuit breaker state at shutdown"
        );
    }
    info!("cadence daemon stopped");
    Ok(())
}

/// Register every job without starting anything, then report next runs.
fn check(config: &CadenceConfig, json: bool) -> anyhow::Result<()> {
    let factory = JobFactory::from_config(config)?;
    let mut scheduler = JobScheduler::new(Arc::new(TracingSink));
    let mut failed = 0usize;
    for job in &config.jobs {
        if let Err(e) = factory.register(&mut scheduler, job) {
            eprintln!("{}: {e:#}", job.name);
            failed += 1;
        }
    }

    scheduler.prime(Utc::now());
    let snapshots = scheduler.jobs();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
    } else {
        for snap in &snapshots {
            let next = snap
                .next_run
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never (no match within a year)".to_string());
            println!("{:<24} {:<20} {}", snap.name, snap.schedule, next);
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} jobs failed validation", config.jobs.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(e) => {
            error!(error = %e, "cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
