//! # freshd Main Entry Point
//!
//! Command-line front end for the index freshness daemon.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};

use freshd::cascade::LEDGER_FILE;
use freshd::config::{AppConfig, ConfigLoader};
use freshd::daemon::Daemon;
use freshd::doctor::run_doctor;
use freshd::processor::NoopProcessor;
use freshd::state::{load_ledger, RepoStateStore};
use freshd::telemetry;

#[derive(Parser)]
#[command(name = "freshd")]
#[command(about = "Keeps semantic-search indexes of registered repositories fresh")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until SIGINT or SIGTERM
    Run,

    /// Run a single scheduling pass, wait for the jobs it spawned, and exit
    Tick,

    /// Register a repository so the daemon keeps its indexes fresh
    Register {
        /// Path to the repository root
        path: PathBuf,
    },

    /// Stop tracking a repository (its index data is left in place)
    Unregister {
        /// Repository id as shown by `freshd status`
        repo_id: String,
    },

    /// Show freshness, backlog, and budget state for every tracked repository
    Status,

    /// Print the effective configuration with secrets redacted
    Config,

    /// Check the state directory, backend tiers, and budget for problems
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ConfigLoader::new().load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = telemetry::init_tracing(&config) {
        eprintln!("failed to initialize tracing: {err}");
        return ExitCode::FAILURE;
    }

    match run_command(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_command(command: Commands, config: AppConfig) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Run => {
            let processor = Arc::new(NoopProcessor);
            let daemon = Daemon::build(config, processor.clone(), processor).await?;
            daemon.run().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tick => {
            let processor = Arc::new(NoopProcessor);
            let mut daemon = Daemon::build(config, processor.clone(), processor).await?;
            let stats = daemon.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Register { path } => {
            let store = RepoStateStore::open(&config.state_dir).await?;
            let repo = store.register(&path, Utc::now()).await?;
            println!("registered {} at {}", repo.repo_id, repo.path.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Unregister { repo_id } => {
            let store = RepoStateStore::open(&config.state_dir).await?;
            if store.remove(&repo_id).await? {
                println!("unregistered {repo_id}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("no repository registered with id {repo_id}");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Status => {
            print_status(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            println!("{}", config.redacted_json()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Doctor => {
            let report = run_doctor(&config).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.healthy {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn print_status(config: &AppConfig) -> anyhow::Result<()> {
    let now = Utc::now();
    let store = RepoStateStore::open(&config.state_dir).await?;
    let mut repos = store.load_all().await?;
    repos.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));

    let ledger = load_ledger(&config.state_dir.join(LEDGER_FILE), &config.budget, now).await?;

    let repos_json: Vec<serde_json::Value> = repos
        .iter()
        .map(|repo| {
            serde_json::json!({
                "repo_id": repo.repo_id,
                "path": repo.path,
                "last_synced_at": repo.last_synced_at,
                "last_enriched_at": repo.last_enriched_at,
                "last_embedded_at": repo.last_embedded_at,
                "pending_enrichment": repo.pending_enrichment_count,
                "pending_embedding": repo.pending_embedding_count,
                "idle_cycles": repo.idle_cycles,
                "consecutive_failures": repo.consecutive_failures,
                "leased": repo.has_live_lease(now),
            })
        })
        .collect();

    let status = serde_json::json!({
        "repos": repos_json,
        "budget": {
            "daily_spend_usd": ledger.daily_spend_usd,
            "daily_cap_usd": config.budget.daily_cap_usd,
            "monthly_spend_usd": ledger.monthly_spend_usd,
            "monthly_cap_usd": config.budget.monthly_cap_usd,
        },
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
