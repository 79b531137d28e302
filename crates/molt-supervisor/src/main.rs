//! `molt`: run a service under the generation supervisor, or talk to one.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use molt_supervisor::ops::{self, OpsRequest};
use molt_supervisor::{telemetry, Supervisor, SupervisorConfig};
use tracing::info;

/// Zero-downtime hot relay for stateful services
#[derive(Parser)]
#[command(name = "molt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Supervisor control socket (overrides the configured path)
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor and the first generation
    Run {
        /// Service command (overrides service.command)
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Hand the running service over to a fresh generation
    Relay {
        /// Command for the new generation (defaults to the current one)
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Show generations and handoff counters
    Status,
    /// Cancel the handoff in progress
    Cancel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SupervisorConfig::load(cli.config.as_deref())
        .context("Failed to load supervisor configuration")?;
    if let Some(socket) = cli.socket {
        config.control.socket_path = Some(socket);
    }

    match cli.command {
        Commands::Run { command } => run(config, command).await,
        Commands::Relay { command } => {
            let command = (!command.is_empty()).then_some(command);
            send(&config, OpsRequest::Relay { command }).await
        }
        Commands::Status => send(&config, OpsRequest::Status).await,
        Commands::Cancel => send(&config, OpsRequest::Cancel).await,
    }
}

async fn run(mut config: SupervisorConfig, command: Vec<String>) -> Result<()> {
    if !command.is_empty() {
        config.service.command = command;
    }
    config.validate().context("Invalid supervisor configuration")?;

    telemetry::init(&config.observability)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!("Molt supervisor starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let supervisor = Supervisor::start(config)
        .await
        .context("Failed to start the first generation")?;
    supervisor.run().await?;

    info!("Molt supervisor stopped");
    Ok(())
}

async fn send(config: &SupervisorConfig, request: OpsRequest) -> Result<()> {
    let path = config.control_socket_path();
    let response = ops::request(&path, &request).await?;

    if !response.ok {
        bail!(response.error.unwrap_or_else(|| "request failed".into()));
    }
    if let Some(result) = response.result {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}
