//! Protocol messages exchanged between clients and the broker.
//!
//! Every frame is a single JSON object tagged by its `"type"` field:
//!
//! ```text
//! {"type":"find_partner","peer_address":"peer-7f3a"}
//! {"type":"paired","role":"initiator","partner_address":"peer-19c2"}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of a pairing originates the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The side that dials its partner (the later arrival).
    Initiator,
    /// The side that waits for the incoming call (the party that was waiting).
    Receiver,
}

impl Role {
    /// Lowercase name, as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity state reported by the client's peer-connection library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    /// Offer/answer exchange in progress.
    Connecting,
    /// Media is flowing between the two peers.
    Connected,
    /// Connectivity was lost.
    Disconnected,
    /// The connection could not be established or broke irrecoverably.
    Failed,
    /// The connection was closed locally.
    Closed,
}

impl PeerConnectionState {
    /// Whether this state ends the peer connection.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Frames sent by a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask to be paired with the next available party.
    FindPartner {
        /// Address the partner's peer-connection library should dial.
        peer_address: String,
    },
    /// Stop waiting for a partner.
    CancelSearch,
    /// Leave the current pairing.
    EndSession,
    /// Report a change in the peer connection established after pairing.
    PeerState {
        /// The new connectivity state.
        state: PeerConnectionState,
    },
    /// Keepalive probe; answered with [`ServerMessage::Pong`].
    Ping {
        /// Opaque token echoed back in the reply.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Answer to a broker [`ServerMessage::Ping`].
    Pong {
        /// Token copied from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl ClientMessage {
    /// Short event name used for logging and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindPartner { .. } => "find_partner",
            Self::CancelSearch => "cancel_search",
            Self::EndSession => "end_session",
            Self::PeerState { .. } => "peer_state",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Build a `find_partner` request.
    pub fn find_partner(peer_address: impl Into<String>) -> Self {
        Self::FindPartner {
            peer_address: peer_address.into(),
        }
    }
}

/// Frames sent by the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection.
    Welcome {
        /// The connection handle assigned by the broker.
        handle: String,
        /// Broker name from its configuration.
        server: String,
    },
    /// The client now occupies the waiting slot.
    Waiting,
    /// A partner was found.
    Paired {
        /// Whether this side dials or answers.
        role: Role,
        /// Address of the partner's peer-connection endpoint.
        partner_address: String,
    },
    /// The search was cancelled and the waiting slot released.
    SearchCancelled,
    /// Acknowledges `end_session`; the client is idle again.
    SessionEnded,
    /// The partner left the pairing.
    PartnerDisconnected {
        /// `true` when the partner dropped without ending the session.
        involuntary: bool,
    },
    /// The peer connection to the partner could not be established.
    PartnerUnreachable,
    /// A request failed in a way the client should know about.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable explanation.
        message: String,
    },
    /// Keepalive probe; clients answer with [`ClientMessage::Pong`].
    Ping {
        /// Opaque token to echo back.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Answer to a client [`ClientMessage::Ping`].
    Pong {
        /// Token copied from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl ServerMessage {
    /// Build an `error` frame.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a `paired` frame.
    pub fn paired(role: Role, partner_address: impl Into<String>) -> Self {
        Self::Paired {
            role,
            partner_address: partner_address.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_partner_wire_format() {
        let json = serde_json::to_string(&ClientMessage::find_partner("peer-1")).unwrap();
        assert_eq!(json, r#"{"type":"find_partner","peer_address":"peer-1"}"#);
    }

    #[test]
    fn test_unit_variants_parse() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"cancel_search"}"#).unwrap();
        assert_eq!(msg, ClientMessage::CancelSearch);
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"end_session"}"#).unwrap();
        assert_eq!(msg, ClientMessage::EndSession);
    }

    #[test]
    fn test_ping_token_is_optional() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { token: None });
        let json = serde_json::to_string(&ServerMessage::Pong { token: None }).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_paired_wire_format() {
        let json = serde_json::to_string(&ServerMessage::paired(Role::Receiver, "peer-2")).unwrap();
        assert_eq!(
            json,
            r#"{"type":"paired","role":"receiver","partner_address":"peer-2"}"#
        );
    }

    #[test]
    fn test_peer_state_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"peer_state","state":"failed"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::PeerState {
                state: PeerConnectionState::Failed
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"join","room":"x"}"#).is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!PeerConnectionState::Connecting.is_terminal());
        assert!(!PeerConnectionState::Connected.is_terminal());
        assert!(PeerConnectionState::Disconnected.is_terminal());
        assert!(PeerConnectionState::Failed.is_terminal());
        assert!(PeerConnectionState::Closed.is_terminal());
    }
}
