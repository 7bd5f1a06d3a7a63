use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mission_control::config::Settings;

mod cmd;

#[derive(Parser)]
#[command(name = "mission-control")]
#[command(version, about = "Task board and war-room orchestrator for OpenClaw agents")]
pub struct Cli {
    /// Debug-level logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Config file (defaults to .mission-control/config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive, bind 0.0.0.0)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and exit
    Init {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Run the war room once and print the outcome as JSON
    WarRoom {
        /// Only review tasks in this workspace
        #[arg(long)]
        workspace: Option<String>,

        /// Apply proposed task moves instead of only recording them
        #[arg(long)]
        apply_moves: bool,
    },
    /// Probe the configured OpenClaw gateway and print the result as JSON
    GatewayStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    mission_control::logging::init(cli.verbose, cli.log_json)?;
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(settings, port, db_path, dev).await?;
        }
        Commands::Init { db_path } => cmd::cmd_init(&settings, db_path)?,
        Commands::WarRoom {
            workspace,
            apply_moves,
        } => cmd::cmd_war_room(settings, workspace, apply_moves).await?,
        Commands::GatewayStatus => cmd::cmd_gateway_status(&settings).await?,
    }

    Ok(())
}
