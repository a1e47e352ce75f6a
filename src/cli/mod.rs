pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use config::RotationPolicy;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and extract every pending item in the queue
    Run {
        /// Number of concurrent fetch tasks
        #[arg(short, long)]
        workers: Option<usize>,

        /// When to request a new proxy identity
        #[arg(short, long, value_enum)]
        rotation: Option<RotationPolicy>,
    },

    /// Show pending, fetched and failed counts
    Status,

    /// Request a new identity from the proxy control port
    Rotate,

    /// Run the content extractor on a local HTML file
    Extract {
        /// HTML file to extract
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration to the config directory
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run { workers, rotation } => {
            info!("Starting extraction run");
            commands::run(config_path, workers, rotation).await
        },
        Commands::Status => commands::status(config_path).await,
        Commands::Rotate => {
            info!("Requesting new identity");
            commands::rotate(config_path).await
        },
        Commands::Extract { file } => commands::extract_file(&file).await,
        Commands::Config { init } => {
            if init {
                commands::init_config().await
            } else {
                commands::show_config(config_path).await
            }
        },
    }
}
