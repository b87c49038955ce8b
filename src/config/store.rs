//! Waiting slot storage configuration.

use serde::Deserialize;
use std::time::Duration;

/// Where the waiting slot is kept.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In this process. Only one broker instance can serve clients.
    #[default]
    Memory,
    /// In a SQLite database that several broker instances open together.
    Shared,
}

/// Queue store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// SQLite database file for the shared backend (`:memory:` allowed).
    #[serde(default = "default_path")]
    pub path: String,
    /// Seconds a waiting entry survives without its owner renewing it (default: 30).
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Seconds between lease renewals and orphan sweeps (default: 10).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Milliseconds between polls for claims and notices (default: 250).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_path(),
            lease_secs: default_lease_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_path() -> String {
    "rendezvous.db".to_string()
}

fn default_lease_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    250
}
