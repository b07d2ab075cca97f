//! Configuration view and validation commands — `dealdesk config`.

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;
use dealdesk::config::DealdeskConfig;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Dealdesk Configuration");
            println!("======================");
            println!();

            let config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                DealdeskConfig::load(config_path)?
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
                DealdeskConfig::default()
            };
            println!();

            println!("[server]");
            println!("  port = {}", config.server.port);
            println!("  db_path = \"{}\"", config.server.db_path);
            println!("  dev_mode = {}", config.server.dev_mode);
            println!();

            println!("[engine]");
            println!("  kyc_pass_threshold = {}", config.engine.kyc_pass_threshold);
            println!(
                "  handoff_completion_delay_secs = {}",
                config.engine.handoff_completion_delay_secs
            );
            println!(
                "  access_code_ttl_minutes = {}",
                config.engine.access_code_ttl_minutes
            );
            if let Some(url) = &config.engine.analyzer_url {
                println!("  analyzer_url = \"{}\"", url);
            }
            println!();

            println!("[poller]");
            println!(
                "  critical_interval_secs = {}",
                config.poller.critical_interval_secs
            );
            println!(
                "  secondary_interval_secs = {}",
                config.poller.secondary_interval_secs
            );
            println!();

            println!("Effective values (with env overrides):");
            println!("  port = {}", config.port());
            println!("  db_path = \"{}\"", config.db_path().display());
            match config.analyzer_url() {
                Some(url) => println!("  analyzer_url = \"{}\"", url),
                None => println!("  analyzer_url = (none, fixed stand-in score)"),
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let config = DealdeskConfig::load(config_path)?;
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
                println!("Config file already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            let config = DealdeskConfig::default();
            config.save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] port, db_path, dev_mode");
            println!("  - [engine] kyc_pass_threshold, handoff_completion_delay_secs, analyzer_url");
            println!("  - [poller] critical_interval_secs, secondary_interval_secs");
            println!();
        }
    }

    Ok(())
}
