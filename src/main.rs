use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use echohub_server::HubConfig;
use echohub_store::Database;
use echohub_telemetry::{init_telemetry, parse_level, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "echohub", about = "Real-time chat hub for the forum backend")]
struct Cli {
    /// JSON config file, deep-merged over the built-in defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and env).
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path (overrides config and env).
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = HubConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&config.telemetry.level).unwrap_or(tracing::Level::INFO),
        json: config.telemetry.json,
        log_db_path: config.telemetry.log_db_path.clone(),
        ..TelemetryConfig::default()
    });

    let db = Database::open(&config.database.path)
        .with_context(|| format!("failed to open database at {}", config.database.path.display()))?;

    let handle = echohub_server::start(&config, db)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!(port = handle.port(), "echohub ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!(connections = handle.connections(), "shutting down");
    handle.shutdown(Some(Duration::from_secs(10))).await;
    Ok(())
}
