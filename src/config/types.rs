//! Core configuration types and loading.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use super::limits::LimitsConfig;
use super::listen::{ListenConfig, TlsConfig, WebSocketConfig};
use super::store::StoreConfig;
use crate::state::InstanceId;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Broker identity.
    pub server: ServerConfig,
    /// Plaintext TCP listener.
    pub listen: ListenConfig,
    /// Optional TLS listener.
    pub tls: Option<TlsConfig>,
    /// Optional WebSocket listener.
    pub websocket: Option<WebSocketConfig>,
    #[serde(default)]
    pub matchmaking: MatchmakingConfig,
    /// Where the waiting slot lives.
    #[serde(default)]
    pub store: StoreConfig,
    /// Keepalive for idle client connections.
    #[serde(default)]
    pub idle_timeouts: IdleTimeoutsConfig,
    /// Frame size, flood and buffering limits.
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Broker identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Broker name, sent to clients in the `welcome` frame.
    pub name: String,
    /// Instance id used to route notices through a shared store.
    /// A random id is generated when absent.
    pub instance: Option<String>,
    /// Prometheus metrics HTTP port (default: 9090, 0 disables).
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    pub fn instance_id(&self) -> InstanceId {
        match &self.instance {
            Some(name) => InstanceId::new(name),
            None => InstanceId::random(),
        }
    }
}

/// Matchmaking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchmakingConfig {
    /// Extra claim/occupy rounds before reporting contention (default: 1).
    #[serde(default = "default_claim_retries")]
    pub claim_retries: u32,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            claim_retries: default_claim_retries(),
        }
    }
}

fn default_claim_retries() -> u32 {
    1
}

/// Idle timeout configuration for client connection keepalive.
///
/// - `ping`: Seconds of silence before the broker sends `ping` (default: 90)
/// - `timeout`: Seconds to wait for any frame after that before disconnecting
///   (default: 120)
#[derive(Debug, Clone, Deserialize)]
pub struct IdleTimeoutsConfig {
    #[serde(default = "default_ping_interval")]
    pub ping: u64,

    /// Total idle time before disconnect = ping + timeout.
    #[serde(default = "default_ping_timeout")]
    pub timeout: u64,
}

impl Default for IdleTimeoutsConfig {
    fn default() -> Self {
        Self {
            ping: default_ping_interval(),
            timeout: default_ping_timeout(),
        }
    }
}

fn default_ping_interval() -> u64 {
    90
}

fn default_ping_timeout() -> u64 {
    120
}
