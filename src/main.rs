//! Featherbone server
//!
//! Serves the engine over HTTP and WebSocket, or prepares a database.

use anyhow::Result;
use clap::{Parser, Subcommand};
use featherbone::{build_datasource, grant_super_user, open_store, Config};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "featherbone")]
#[command(about = "Schema-driven relational data engine")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Port to listen on (overrides config.yaml and SERVER_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Create the system tables and optionally bootstrap a super user
    Init {
        /// User to add to the super role
        #[arg(long)]
        admin: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,featherbone=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server_port = port;
            }
            featherbone::start_server(config).await
        }
        Commands::Init { admin } => run_init(config, admin.as_deref()).await,
    }
}

async fn run_init(config: Config, admin: Option<&str>) -> Result<()> {
    if config.uses_memory_store() {
        tracing::warn!("No database configured; the in-memory store is discarded on exit");
    }
    let store = open_store(&config).await?;
    let datasource = build_datasource(&config, store).await?;
    tracing::info!("System tables ready");

    if let Some(admin) = admin {
        grant_super_user(&datasource, admin).await?;
    }
    Ok(())
}
