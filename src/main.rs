use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use delve::config::{DELVE_DIR, DelveToml};
use delve::logging::{self, LogOptions};
use delve::pipeline::Phase;
use delve::store::SessionStore;

mod cmd;

#[derive(Parser)]
#[command(name = "delve")]
#[command(version, about = "Inspect research pipeline sessions and configuration")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Session directory. Overrides delve.toml and DELVE_STORE_DIR.
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List stored sessions
    Sessions,
    /// Show a session's phase, rounds and coverage
    Status {
        id: String,
        /// Print the restored session as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a session's record log
    History {
        id: String,
        /// Only records written in this phase (requires --round)
        #[arg(long, requires = "round")]
        phase: Option<Phase>,
        #[arg(long)]
        round: Option<u32>,
        /// Only records for this task id
        #[arg(long, conflicts_with = "phase")]
        task: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default delve.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let delve_dir = project_dir.join(DELVE_DIR);

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = DelveToml::load_or_default(&delve_dir)?.with_env()?;
    let _guard = logging::init(&LogOptions::from_config(&config.logging, cli.verbose))?;
    let store_dir = cli
        .store_dir
        .clone()
        .unwrap_or_else(|| config.store_dir(&project_dir));
    let store = SessionStore::open(&store_dir, config.store.max_concurrent_sessions);

    match &cli.command {
        Commands::Sessions => cmd::cmd_sessions(&store, &store_dir).await?,
        Commands::Status { id, json } => cmd::cmd_status(&store, id, *json).await?,
        Commands::History {
            id,
            phase,
            round,
            task,
        } => cmd::cmd_history(&store, id, *phase, *round, task.as_deref()).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
