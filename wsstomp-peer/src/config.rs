use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use wsstomp_proto::HeartBeat;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    #[serde(default)]
    pub peer: PeerSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerSettings {
    /// Bridge endpoint to dial
    #[serde(default = "default_url")]
    pub url: String,
    /// Heartbeat interval offered to the bridge in milliseconds (0 disables)
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_heartbeat() -> u64 {
    10_000
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            heartbeat_ms: default_heartbeat(),
        }
    }
}

impl PeerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PeerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            peer: PeerSettings::default(),
        }
    }

    pub fn heartbeat(&self) -> HeartBeat {
        HeartBeat::symmetric(Duration::from_millis(self.peer.heartbeat_ms))
    }
}
