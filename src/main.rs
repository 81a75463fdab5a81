use anyhow::Result;
use clap::{Parser, Subcommand};
use neuber_gate::config::Config;
use neuber_gate::server::{build_governor, Server};
use neuber_gate::storage::SqliteStore;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "neuber-gate", version, about = "Session, rate limit and usage governance")]
struct Cli {
    /// Override BIND_ADDR
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Create or upgrade the SQLite schema and exit
    Migrate,
    /// Purge sessions past the retention period once and exit
    Sweep,
    /// Print the number of tracked sessions
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    // Load configuration from environment
    let mut config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("neuber_gate={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!("Starting neuber gate");
            tracing::info!(
                bind_addr = %config.bind_addr,
                storage = %config.storage_backend,
                redis = config.redis_url.is_some(),
                window_secs = config.rate_limit_window_secs,
                max_requests = config.rate_limit_requests,
                "Configuration loaded"
            );

            let server = Server::new(config)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

            server
                .run()
                .await
                .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
        }
        Command::Migrate => {
            let store = SqliteStore::connect(&config.database_url, 1).await?;
            let version = store.schema_version().await?;
            store.close().await;
            println!("schema version {}", version);
        }
        Command::Sweep => {
            let governor = build_governor(&config).await?;
            let purged = governor.sweep_sessions().await?;
            println!("purged {} sessions", purged);
        }
        Command::Sessions => {
            let governor = build_governor(&config).await?;
            println!("{}", governor.sessions().count().await?);
        }
    }

    Ok(())
}
