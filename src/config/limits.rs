//! Connection limits configuration.

use serde::Deserialize;

/// Frame size, flood protection and buffering limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Longest accepted client frame in bytes (default: 4096).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Frames allowed per client per second (default: 20).
    #[serde(default = "default_message_rate")]
    pub message_rate_per_second: u32,
    /// Connection burst allowed per IP (default: 10).
    #[serde(default = "default_connection_burst")]
    pub connection_burst_per_ip: u32,
    /// Frames queued for a client before new ones are dropped (default: 64).
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            message_rate_per_second: default_message_rate(),
            connection_burst_per_ip: default_connection_burst(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

fn default_max_frame_len() -> usize {
    rendezvous_proto::DEFAULT_MAX_LINE_LEN
}

fn default_message_rate() -> u32 {
    20
}

fn default_connection_burst() -> u32 {
    10
}

fn default_outbox_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_correct() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.max_frame_len, 4096);
        assert_eq!(limits.message_rate_per_second, 20);
        assert_eq!(limits.connection_burst_per_ip, 10);
        assert_eq!(limits.outbox_capacity, 64);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let limits: LimitsConfig = toml::from_str("outbox_capacity = 8").unwrap();
        assert_eq!(limits.outbox_capacity, 8);
        assert_eq!(limits.max_frame_len, 4096);
    }
}
