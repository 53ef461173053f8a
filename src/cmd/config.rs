//! Configuration view and validation commands: `clonesmith config`.

use std::path::Path;

use anyhow::Result;
use clonesmith::config::{CONFIG_FILE_NAME, Config};

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &Config,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.storage.data_dir.join(CONFIG_FILE_NAME));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("clonesmith configuration");
            println!("========================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} at {} (using defaults)", CONFIG_FILE_NAME, config_path.display());
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", toml::to_string_pretty(config)?);
            println!();
            println!("Worker callback URL: {}", config.callback_url());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut defaults = Config::default();
            defaults.storage.data_dir = config.storage.data_dir.clone();
            defaults.save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, callback_url");
            println!("  - [pipeline] parse_command, index_command, adapt_command");
            println!("  - [worker] command, heartbeat_timeout_secs, stop_grace_secs");
            println!();
        }
    }

    Ok(())
}
