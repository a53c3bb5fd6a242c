mod config;
mod handler;
mod session;

use crate::config::ServerConfig;
use crate::handler::ConnectionHandler;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config);

    info!("wsstomp server v{} starting...", env!("CARGO_PKG_VERSION"));

    let settings = config.session_settings()?;
    info!(
        "Sessions subscribe to {} (ack: {}, heartbeat: {}ms)",
        settings.destination, settings.ack_mode, config.stomp.heartbeat_ms
    );

    // Create connection handler
    let handler = Arc::new(ConnectionHandler::new(settings, config.server.path.clone()));

    // Bind to listen address
    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;

    info!("Listening on ws://{}{}", listen_addr, config.server.path);
    match config.limits.max_conns {
        Some(max) => info!("Maximum concurrent connections: {}", max),
        None => info!("Maximum concurrent connections: unbounded"),
    }

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        ctrl_c.cancel();
    });

    handler::serve(listener, handler, config.limits.max_conns, shutdown).await?;

    info!("Server stopped");
    Ok(())
}

fn load_config() -> anyhow::Result<ServerConfig> {
    // Explicit path wins and must load
    if let Some(path) = std::env::args().nth(1) {
        let config = ServerConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path, e))?;
        info!("Loaded config from {}", path);
        return Ok(config);
    }

    for path in ["/etc/wsstomp/server.toml", "configs/server.toml", "server.toml"] {
        if let Ok(config) = ServerConfig::from_file(path) {
            info!("Loaded config from {}", path);
            return Ok(config);
        }
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(ServerConfig::default_config())
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));

    if config.logging.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }
}
