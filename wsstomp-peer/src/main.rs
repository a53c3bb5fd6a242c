mod config;
mod peer;

use crate::config::PeerConfig;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use wsstomp_proto::{BrokerSession, WsStream, DEFAULT_MAX_FRAME_SIZE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();

    info!("wsstomp peer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = load_config()?;

    info!("Connecting to bridge at {}...", config.peer.url);
    let (ws, _) = match tokio_tungstenite::connect_async(config.peer.url.as_str()).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Failed to connect: {}", e);
            return Err(e.into());
        }
    };

    info!("Connected to {}", config.peer.url);

    let broker = BrokerSession::accept(WsStream::new(ws), config.heartbeat(), DEFAULT_MAX_FRAME_SIZE).await?;

    println!("\nBridge connected. Each line you type is published to its subscriptions.");
    println!("Press Ctrl-D to stop publishing.\n");

    peer::run(broker, BufReader::new(tokio::io::stdin())).await?;

    Ok(())
}

fn load_config() -> anyhow::Result<PeerConfig> {
    // Explicit path wins and must load
    if let Some(path) = std::env::args().nth(1) {
        let config = PeerConfig::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path, e))?;
        info!("Loaded config from {}", path);
        return Ok(config);
    }

    for path in ["configs/peer.toml", "peer.toml"] {
        if let Ok(config) = PeerConfig::from_file(path) {
            info!("Loaded config from {}", path);
            return Ok(config);
        }
    }

    // Use default config as last resort
    warn!("No config file found, using default configuration");
    Ok(PeerConfig::default_config())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
