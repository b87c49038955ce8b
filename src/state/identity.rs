//! Connection handles, peer addresses and session identities.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BrokerError;

/// Longest peer address accepted from a client, in bytes.
pub const MAX_PEER_ADDRESS_LEN: usize = 256;

/// Opaque handle for one live client connection.
///
/// Handles are random v4 UUIDs so they stay unique across every broker
/// instance sharing a queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    /// Allocate a fresh handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionHandle {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Name of a broker instance, used to route notices through the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Arc<str>);

impl InstanceId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// A random instance name for brokers started without one.
    pub fn random() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The address a partner dials to reach a client's peer connection.
///
/// The broker never interprets it beyond basic hygiene checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Validate a client-supplied address.
    pub fn parse(raw: impl Into<String>) -> Result<Self, BrokerError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(BrokerError::InvalidPeerAddress("address is empty"));
        }
        if raw.len() > MAX_PEER_ADDRESS_LEN {
            return Err(BrokerError::InvalidPeerAddress("address is too long"));
        }
        if raw.chars().any(char::is_control) {
            return Err(BrokerError::InvalidPeerAddress(
                "address contains control characters",
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is asking to be paired: the connection, where its peer can be
/// reached, and when it registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub handle: ConnectionHandle,
    pub peer_address: PeerAddress,
    pub arrived_at: DateTime<Utc>,
}

impl SessionIdentity {
    /// Register a connection's peer address, stamping the arrival time.
    ///
    /// The stamp is kept to millisecond precision, which is what the shared
    /// queue store persists.
    pub fn register(handle: ConnectionHandle, peer_address: PeerAddress) -> Self {
        Self {
            handle,
            peer_address,
            arrived_at: Utc::now().trunc_subsecs(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = ConnectionHandle::generate();
        let b = ConnectionHandle::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_parses_its_display() {
        let handle = ConnectionHandle::generate();
        let parsed: ConnectionHandle = handle.to_string().parse().unwrap();
        assert_eq!(parsed, handle);
        assert!("not-a-uuid".parse::<ConnectionHandle>().is_err());
    }

    #[test]
    fn test_peer_address_validation() {
        assert!(PeerAddress::parse("peer-7f3a").is_ok());
        assert!(matches!(
            PeerAddress::parse(""),
            Err(BrokerError::InvalidPeerAddress(_))
        ));
        assert!(matches!(
            PeerAddress::parse("   "),
            Err(BrokerError::InvalidPeerAddress(_))
        ));
        assert!(matches!(
            PeerAddress::parse("a\nb"),
            Err(BrokerError::InvalidPeerAddress(_))
        ));
        assert!(PeerAddress::parse("x".repeat(MAX_PEER_ADDRESS_LEN)).is_ok());
        assert!(PeerAddress::parse("x".repeat(MAX_PEER_ADDRESS_LEN + 1)).is_err());
    }

    #[test]
    fn test_register_stamps_arrival() {
        let before = Utc::now().trunc_subsecs(3);
        let identity = SessionIdentity::register(
            ConnectionHandle::generate(),
            PeerAddress::parse("peer-a").unwrap(),
        );
        let after = Utc::now();
        assert!(identity.arrived_at >= before && identity.arrived_at <= after);
        assert_eq!(identity.arrived_at.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(identity.peer_address.as_str(), "peer-a");
    }
}
