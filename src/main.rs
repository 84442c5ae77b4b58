use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use reqforge::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "reqforge")]
#[command(version, about = "Asynchronous code-generation job pipeline")]
pub struct Cli {
    /// Path to the configuration file. A missing file means defaults.
    #[arg(short, long, global = true, default_value = "reqforge.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the job pipeline and its HTTP API
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create the job database and its tables
    InitDb,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Drop expired event streams once and exit
    Purge,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_layered(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let _log_guard = reqforge::logging::init(&config.logging);

    match &cli.command {
        Commands::Serve { port } => cmd::cmd_serve(config, *port).await?,
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone())?,
        Commands::Purge => cmd::cmd_purge(&config).await?,
    }

    Ok(())
}
