//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::{Config, StoreBackend};
use std::path::Path;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("server.instance must not be empty when set")]
    EmptyInstanceId,
    #[error("tls.cert_path does not exist: {0}")]
    TlsCertNotFound(String),
    #[error("tls.key_path does not exist: {0}")]
    TlsKeyNotFound(String),
    #[error("store.path parent directory does not exist: {0}")]
    StorePathInvalid(String),
    #[error("store.lease_secs ({lease}) must be longer than store.heartbeat_secs ({heartbeat})")]
    LeaseTooShort { lease: u64, heartbeat: u64 },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // Required fields
    if config.server.name.trim().is_empty() {
        errors.push(ValidationError::MissingServerName);
    }
    if let Some(instance) = &config.server.instance
        && instance.trim().is_empty()
    {
        errors.push(ValidationError::EmptyInstanceId);
    }

    // TLS validation
    if let Some(ref tls) = config.tls {
        if !Path::new(&tls.cert_path).exists() {
            errors.push(ValidationError::TlsCertNotFound(tls.cert_path.clone()));
        }
        if !Path::new(&tls.key_path).exists() {
            errors.push(ValidationError::TlsKeyNotFound(tls.key_path.clone()));
        }
    }

    // Shared store validation
    let store = &config.store;
    if store.backend == StoreBackend::Shared {
        if store.path != ":memory:"
            && let Some(parent) = Path::new(&store.path).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            errors.push(ValidationError::StorePathInvalid(store.path.clone()));
        }
        if store.lease_secs <= store.heartbeat_secs {
            errors.push(ValidationError::LeaseTooShort {
                lease: store.lease_secs,
                heartbeat: store.heartbeat_secs,
            });
        }
        if store.heartbeat_secs == 0 {
            errors.push(ValidationError::ZeroLimit("store.heartbeat_secs"));
        }
        if store.poll_interval_ms == 0 {
            errors.push(ValidationError::ZeroLimit("store.poll_interval_ms"));
        }
    }

    // Limits
    let limits = &config.limits;
    for (name, value) in [
        ("limits.max_frame_len", limits.max_frame_len as u64),
        ("limits.message_rate_per_second", u64::from(limits.message_rate_per_second)),
        ("limits.connection_burst_per_ip", u64::from(limits.connection_burst_per_ip)),
        ("limits.outbox_capacity", limits.outbox_capacity as u64),
        ("idle_timeouts.ping", config.idle_timeouts.ping),
        ("idle_timeouts.timeout", config.idle_timeouts.timeout),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroLimit(name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
