use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "dealdesk")]
#[command(version, about = "Transaction lifecycle engine for brokerage deals")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "dealdesk.toml", global = true)]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the lifecycle engine HTTP server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<String>,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Follow one transaction, printing lifecycle changes as they land
    Watch {
        /// Transaction to follow
        transaction_id: i64,

        /// Engine base URL
        #[arg(long, default_value = "http://localhost:3325")]
        server: String,

        /// Role to poll as: client, agent, system
        #[arg(long, default_value = "agent")]
        role: String,

        /// Actor id to poll as
        #[arg(long, default_value = "workbench")]
        actor_id: String,
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
    /// Initialize a default dealdesk.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    dealdesk::telemetry::init_telemetry(cli.log_json)?;

    match &cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(&cli.config, *port, db_path.clone(), *dev).await?;
        }
        Commands::Watch {
            transaction_id,
            server,
            role,
            actor_id,
        } => {
            cmd::cmd_watch(&cli.config, *transaction_id, server, role, actor_id).await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cli.config, command.clone())?;
        }
    }

    Ok(())
}
