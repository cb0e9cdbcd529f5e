//! `flotilla` operator tool: validate configuration and inspect checkpoints.

mod commands;

use clap::{Parser, Subcommand};
use flotilla_coordinator::CoordinatorConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flotilla", about = "Flotilla: multi-agent coordination toolkit")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flotilla.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration tools
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Checkpoint tools
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a configuration file
    Check {
        /// File to check (defaults to --config)
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List stored checkpoints
    List {
        /// Checkpoint directory (defaults to the configured one)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Verify a checkpoint file and summarize it
    Inspect {
        file: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    let output = match cli.command {
        Commands::Config {
            action: ConfigAction::Check { file },
        } => commands::config_check(&file.unwrap_or(cli.config)).await?,
        Commands::Checkpoint { action } => match action {
            CheckpointAction::List { dir, json } => {
                let dir = match dir {
                    Some(dir) => dir,
                    None => configured_dir(&cli.config).await?,
                };
                commands::checkpoint_list(&dir, json).await?
            }
            CheckpointAction::Inspect { file, json } => {
                commands::checkpoint_inspect(&file, json).await?
            }
        },
    };
    println!("{output}");
    Ok(())
}

/// Checkpoint directory from the config file, or the default when there is none.
async fn configured_dir(config: &Path) -> anyhow::Result<PathBuf> {
    if tokio::fs::try_exists(config).await.unwrap_or(false) {
        Ok(CoordinatorConfig::load(config).await?.checkpoint.directory)
    } else {
        Ok(CoordinatorConfig::default().checkpoint.directory)
    }
}
