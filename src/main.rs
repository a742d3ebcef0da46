//! fleetd binary: run the agent daemon, or manage enrollment state.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleetd::agent::{Agent, ConnectionState};
use fleetd::config::Config;
use fleetd::facts::{HostFactProvider, SystemFactProvider};
use fleetd::secrets::default_store;

#[derive(Parser)]
#[command(name = "fleetd", version, about = "Fleet-management endpoint agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent daemon until interrupted.
    Run,
    /// Enroll this device with the control plane using a one-time token.
    Enroll {
        #[arg(long, env = "FLEETD_ENROLLMENT_TOKEN")]
        token: String,
    },
    /// Clear all local state: credentials and registration.
    Reset,
    /// Print the connection state and recent notifications.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("loading configuration")?;
    let store = default_store(&config).context("opening secret store")?;
    let facts: Arc<dyn HostFactProvider> = Arc::new(SystemFactProvider::new());
    let agent = Agent::new(config, store, facts);

    match cli.command {
        Command::Run => {
            let state = agent.initialize().await?;
            if state != ConnectionState::Authenticated {
                tracing::warn!("not enrolled; run `fleetd enroll --token <TOKEN>` first");
            }
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            agent.shutdown().await;
        }
        Command::Enroll { token } => {
            let state = agent.initialize().await?;
            if state == ConnectionState::Authenticated {
                anyhow::bail!("already enrolled; run `fleetd reset` first");
            }
            agent.enroll(&token).await?;
            let agent_id = agent.agent_id().await.unwrap_or_default();
            println!("enrolled, agent id: {agent_id}");
            agent.shutdown().await;
        }
        Command::Reset => {
            agent.reset().await?;
            println!("agent reset, all local state cleared");
        }
        Command::Status => {
            let state = agent.initialize().await?;
            println!("state: {state}");
            if let Some(agent_id) = agent.agent_id().await {
                println!("agent id: {agent_id}");
            }
            let recent = agent.notifications().recent();
            if !recent.is_empty() {
                println!("recent notifications:");
                for n in recent {
                    println!(
                        "  {}  {}  {}",
                        n.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        n.event,
                        n.message
                    );
                }
            }
            agent.shutdown().await;
        }
    }

    Ok(())
}
