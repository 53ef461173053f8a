use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use clonesmith::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "clonesmith")]
#[command(version, about = "Clone orchestrator: training pipelines and worker supervision")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Data directory (records, uploads, job outputs, breadcrumbs, logs)
    #[arg(long, global = true, env = "CLONESMITH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to clonesmith.toml. Defaults to <data-dir>/clonesmith.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator HTTP server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (CORS permissive for a local UI dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Terminate workers left behind by a previous run and exit
    Sweep,
    /// List training jobs from disk
    Jobs {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List clones from disk
    Clones {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// View and manage configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default clonesmith.toml into the data directory
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref(), cli.data_dir.as_deref())?;
    if let Commands::Serve { host, port, .. } = &cli.command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }

    match &cli.command {
        Commands::Serve { dev, .. } => {
            let _guard = clonesmith::logging::init(&config.logging, cli.verbose)?;
            cmd::cmd_serve(config, *dev).await?;
        }
        Commands::Sweep => {
            let _guard = clonesmith::logging::init(&config.logging, cli.verbose)?;
            cmd::cmd_sweep(&config).await?;
        }
        Commands::Jobs { json } => cmd::cmd_jobs(&config, *json)?,
        Commands::Clones { json } => cmd::cmd_clones(&config, *json)?,
        Commands::Config { command } => {
            cmd::cmd_config(&config, cli.config.as_deref(), command.clone())?
        }
    }

    Ok(())
}
