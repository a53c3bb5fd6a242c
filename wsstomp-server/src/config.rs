use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use wsstomp_proto::{AckMode, ConnectOptions, HeartBeat};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub stomp: StompSettings,
    #[serde(default)]
    pub limits: LimitsSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Only upgrade requests for this path are accepted
    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StompSettings {
    /// Destination every session subscribes to
    #[serde(default = "default_destination")]
    pub destination: String,
    /// auto, client or client-individual
    #[serde(default = "default_ack_mode")]
    pub ack_mode: String,
    /// Outbound and inbound heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,
    /// Extra time allowed before a missing heartbeat fails the session
    #[serde(default = "default_heartbeat_grace")]
    pub heartbeat_grace_ms: u64,
    /// How long to wait for SUBSCRIBE and DISCONNECT receipts
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_ms: u64,
    /// CONNECT `host` header
    #[serde(default = "default_host")]
    pub host: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsSettings {
    /// Maximum STOMP frame size in bytes
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
    /// Maximum concurrent connections (unset = unbounded)
    #[serde(default)]
    pub max_conns: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_destination() -> String {
    "/queue/test".to_string()
}

fn default_ack_mode() -> String {
    "auto".to_string()
}

fn default_heartbeat() -> u64 {
    10_000
}

fn default_heartbeat_grace() -> u64 {
    5_000
}

fn default_receipt_timeout() -> u64 {
    5_000
}

fn default_host() -> String {
    "/".to_string()
}

fn default_max_frame() -> usize {
    wsstomp_proto::DEFAULT_MAX_FRAME_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StompSettings {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            ack_mode: default_ack_mode(),
            heartbeat_ms: default_heartbeat(),
            heartbeat_grace_ms: default_heartbeat_grace(),
            receipt_timeout_ms: default_receipt_timeout(),
            host: default_host(),
        }
    }
}

impl Default for LimitsSettings {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame(),
            max_conns: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            server: ServerSettings {
                listen_addr: "0.0.0.0".to_string(),
                listen_port: 8080,
                path: default_path(),
            },
            stomp: StompSettings::default(),
            limits: LimitsSettings::default(),
            logging: LoggingSettings::default(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.listen_port)
    }

    /// Per-session parameters handed to the acceptor
    pub fn session_settings(&self) -> anyhow::Result<SessionSettings> {
        let ack_mode: AckMode = self
            .stomp
            .ack_mode
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid ack_mode: {:?}", self.stomp.ack_mode))?;

        if self.stomp.destination.is_empty() {
            anyhow::bail!("stomp.destination must not be empty");
        }

        Ok(SessionSettings {
            destination: self.stomp.destination.clone(),
            ack_mode,
            connect: ConnectOptions {
                host: self.stomp.host.clone(),
                heartbeat: HeartBeat::symmetric(Duration::from_millis(self.stomp.heartbeat_ms)),
                heartbeat_grace: Duration::from_millis(self.stomp.heartbeat_grace_ms),
                receipt_timeout: Duration::from_millis(self.stomp.receipt_timeout_ms),
                max_frame_size: self.limits.max_frame_bytes,
            },
        })
    }
}
