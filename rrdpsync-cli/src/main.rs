//! rrdpsync: keeps local copies of RRDP repositories up to date.
//!
//! # Usage
//!
//! ```bash
//! # Run the scheduler until interrupted
//! rrdpsync --config rrdpsync.toml run
//!
//! # One cycle for every (or one) repository
//! rrdpsync --config rrdpsync.toml sync
//! rrdpsync --config rrdpsync.toml sync --repository ripe
//!
//! # Show stored state
//! rrdpsync --config rrdpsync.toml info
//!
//! # View and prune the outcome log
//! rrdpsync --config rrdpsync.toml log ripe --limit 20
//! rrdpsync --config rrdpsync.toml prune-log ripe --keep 100
//! ```

mod outcome_log;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use rrdp_core::{
    Config, FileStateStore, HttpFetchClient, MetricsRecorder, OutcomeLog, OutcomeSinks,
    RepositorySyncWorker, StateStore, SyncOutcome, SyncScheduler, TriggerResult,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rrdpsync")]
#[command(version)]
#[command(about = "RRDP repository synchronization tool")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "rrdpsync.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run,

    /// Run one synchronization cycle and print the outcomes
    Sync {
        /// Only synchronize this repository
        #[arg(short, long)]
        repository: Option<String>,
    },

    /// Display stored repository state
    Info,

    /// View the outcome log of a repository
    Log {
        /// Repository name
        repository: String,
        /// Show only the last N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Keep only the last N outcome log entries of a repository
    #[command(name = "prune-log")]
    PruneLog {
        /// Repository name
        repository: String,
        /// Number of entries to keep
        #[arg(long)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "rrdpsync=debug,rrdp_core=debug"
    } else {
        "rrdpsync=info,rrdp_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Sync { repository } => cmd_sync(config, repository).await,
        Commands::Info => cmd_info(config).await,
        Commands::Log { repository, limit } => cmd_log(config, repository, limit),
        Commands::PruneLog { repository, keep } => cmd_prune_log(config, repository, keep),
    }
}

fn build_scheduler(config: &Config) -> Result<SyncScheduler> {
    let http = config.scheduler.http_fetch_config();
    let fetcher = HttpFetchClient::new(&http).context("Failed to create HTTP client")?;
    let store = FileStateStore::new(&config.scheduler.state_dir);
    let mut worker = RepositorySyncWorker::new(Arc::new(fetcher), Arc::new(store))
        .with_validator(config.scheduler.object_validator());

    let mut metrics = MetricsRecorder::new();
    for descriptor in &config.repositories {
        metrics = metrics.with_repository(descriptor);
        if descriptor.connect_to.is_empty() {
            continue;
        }
        let pinned_http = http.clone().with_connect_to(descriptor.connect_to.clone());
        let pinned = HttpFetchClient::new(&pinned_http)
            .with_context(|| format!("Failed to create HTTP client for {}", descriptor.id))?;
        tracing::debug!(
            repository = %descriptor.id,
            connect_to = %descriptor.connect_to_label(),
            "using pinned addresses"
        );
        worker = worker.with_repository_fetcher(descriptor.id.clone(), Arc::new(pinned));
    }

    let sinks = OutcomeSinks::new()
        .with(Arc::new(metrics))
        .with(Arc::new(OutcomeLog::in_state_dir(&config.scheduler.state_dir)));

    let scheduler = SyncScheduler::new(config.scheduler.clone(), worker, Arc::new(sinks));
    for descriptor in &config.repositories {
        scheduler.add_repository(descriptor.clone())?;
    }
    Ok(scheduler)
}

fn check_repository(config: &Config, name: &str) -> Result<()> {
    if config.repository(name).is_none() {
        bail!("Unknown repository {:?}", name);
    }
    Ok(())
}

async fn cmd_run(config: Config) -> Result<()> {
    let scheduler = build_scheduler(&config)?;
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received, shutting down"),
            Err(e) => tracing::error!(error = %e, "failed to listen for interrupt"),
        }
        signal.cancel();
    });

    scheduler.run(shutdown).await;
    Ok(())
}

async fn cmd_sync(config: Config, repository: Option<String>) -> Result<()> {
    let scheduler = build_scheduler(&config)?;

    let outcomes: Vec<SyncOutcome> = match repository {
        Some(name) => {
            check_repository(&config, &name)?;
            match scheduler.trigger(&name) {
                TriggerResult::Dispatched(handle) => vec![handle.await.context("Sync task failed")?],
                TriggerResult::AlreadyRunning => bail!("{} is already synchronizing", name),
                TriggerResult::UnknownRepository => bail!("Unknown repository {:?}", name),
            }
        }
        None => scheduler.run_once().await,
    };

    for outcome in &outcomes {
        println!("{}", outcome_log::format_outcome(outcome));
    }

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if failed > 0 {
        return Err(anyhow!(
            "{} of {} repositories failed to synchronize",
            failed,
            outcomes.len()
        ));
    }
    Ok(())
}

async fn cmd_info(config: Config) -> Result<()> {
    let store = FileStateStore::new(&config.scheduler.state_dir);
    let log = OutcomeLog::in_state_dir(&config.scheduler.state_dir);

    println!("State directory: {}", config.scheduler.state_dir.display());
    for descriptor in &config.repositories {
        println!("\nRepository: {}", descriptor.id);
        println!("  Notification:   {}", descriptor.notification_url);
        if let Some(ta) = &descriptor.trust_anchor {
            println!("  Trust anchor:   {}", ta);
        }
        if let Some(host) = &descriptor.override_hostname {
            println!("  Host override:  {}", host);
        }
        if !descriptor.connect_to.is_empty() {
            println!("  Connect to:     {}", descriptor.connect_to_label());
        }

        let state = store
            .load(&descriptor.id)
            .await
            .with_context(|| format!("Failed to load state of {}", descriptor.id))?;
        match state {
            Some(s) => {
                println!("  Session:        {}", s.session_id);
                println!("  Serial:         {}", s.serial);
                println!("  Objects:        {}", s.object_count());
                println!("  Snapshot:       {}", s.snapshot_uri);
                println!(
                    "  Updated:        {}",
                    s.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            None => println!("  No state stored (never synchronized)."),
        }

        if let Some(last) = log.latest(&descriptor.id)? {
            println!("  Last cycle:     {}", outcome_log::format_outcome(&last));
        }
    }
    Ok(())
}

fn cmd_log(config: Config, repository: String, limit: Option<usize>) -> Result<()> {
    check_repository(&config, &repository)?;
    let log = OutcomeLog::in_state_dir(&config.scheduler.state_dir);
    let mut stdout = std::io::stdout();
    outcome_log::print_outcome_log(&log, &repository, limit, &mut stdout)
}

fn cmd_prune_log(config: Config, repository: String, keep: usize) -> Result<()> {
    check_repository(&config, &repository)?;
    let log = OutcomeLog::in_state_dir(&config.scheduler.state_dir);
    let removed = log
        .prune(&repository, keep)
        .with_context(|| format!("Failed to prune outcome log of {}", repository))?;
    println!("Removed {} entries, kept at most {}.", removed, keep);
    Ok(())
}
