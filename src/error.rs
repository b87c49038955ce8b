//! Unified error handling for rendezvousd.
//!
//! Errors raised while matching and pairing clients, with metric labels and
//! the mapping to client-visible `error` frames.

use rendezvous_proto::ServerMessage;
use thiserror::Error;

use crate::db::DbError;
use crate::state::ConnectionHandle;

// ============================================================================
// Broker Errors (matchmaking and session lifecycle)
// ============================================================================

/// Errors produced while processing a client event.
///
/// Every variant leaves broker state consistent. Most are recovered locally;
/// see [`BrokerError::to_reply`] for the ones a client is told about.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("already waiting or paired")]
    AlreadyWaiting,

    #[error("not waiting for a partner")]
    NotWaiting,

    #[error("not paired")]
    NotPaired,

    #[error("waiting slot still contended after {attempts} attempts")]
    ContentionExceeded { attempts: u32 },

    #[error("partner unreachable")]
    PartnerUnreachable,

    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(&'static str),

    #[error("unknown session: {0}")]
    UnknownSession(ConnectionHandle),

    #[error("session {0} already belongs to a pairing")]
    DuplicatePairing(ConnectionHandle),

    #[error("{trigger} is not valid while {phase}")]
    InvalidTransition {
        phase: &'static str,
        trigger: &'static str,
    },

    #[error("queue store error: {0}")]
    Store(#[from] DbError),

    #[error("broker is shutting down")]
    BrokerGone,
}

impl BrokerError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyWaiting => "already_waiting",
            Self::NotWaiting => "not_waiting",
            Self::NotPaired => "not_paired",
            Self::ContentionExceeded { .. } => "contention_exceeded",
            Self::PartnerUnreachable => "partner_unreachable",
            Self::InvalidPeerAddress(_) => "invalid_peer_address",
            Self::UnknownSession(_) => "unknown_session",
            Self::DuplicatePairing(_) => "duplicate_pairing",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Store(_) => "store_unavailable",
            Self::BrokerGone => "broker_gone",
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ContentionExceeded { .. } | Self::Store(_) | Self::BrokerGone
        )
    }

    /// Convert to the frame sent back to the client.
    ///
    /// Returns `None` for errors the client is not told about: requests that
    /// were no-ops in the current state, and internal inconsistencies that
    /// were already logged.
    pub fn to_reply(&self) -> Option<ServerMessage> {
        let reply = match self {
            Self::ContentionExceeded { .. } => ServerMessage::error(
                self.error_code(),
                "matchmaking is busy, send find_partner again",
            ),
            Self::PartnerUnreachable => ServerMessage::PartnerUnreachable,
            Self::InvalidPeerAddress(reason) => {
                ServerMessage::error(self.error_code(), *reason)
            }
            Self::Store(_) | Self::BrokerGone => ServerMessage::error(
                "unavailable",
                "matchmaking is temporarily unavailable, try again",
            ),

            // Rejected no-ops and internal errors stay silent
            Self::AlreadyWaiting => return None,
            Self::NotWaiting => return None,
            Self::NotPaired => return None,
            Self::UnknownSession(_) => return None,
            Self::DuplicatePairing(_) => return None,
            Self::InvalidTransition { .. } => return None,
        };
        Some(reply)
    }
}

/// Result type for broker operations.
pub type BrokerResult = Result<(), BrokerError>;

// DbError stays in db/mod.rs next to the sqlx conversions.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_codes() {
        assert_eq!(BrokerError::AlreadyWaiting.error_code(), "already_waiting");
        assert_eq!(
            BrokerError::ContentionExceeded { attempts: 2 }.error_code(),
            "contention_exceeded"
        );
        assert_eq!(
            BrokerError::InvalidPeerAddress("empty").error_code(),
            "invalid_peer_address"
        );
    }

    #[test]
    fn test_only_visible_errors_reply() {
        assert!(BrokerError::AlreadyWaiting.to_reply().is_none());
        assert!(BrokerError::NotWaiting.to_reply().is_none());
        assert!(BrokerError::NotPaired.to_reply().is_none());

        assert_eq!(
            BrokerError::PartnerUnreachable.to_reply(),
            Some(ServerMessage::PartnerUnreachable)
        );
        let contended = BrokerError::ContentionExceeded { attempts: 2 };
        match contended.to_reply() {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "contention_exceeded"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(BrokerError::ContentionExceeded { attempts: 1 }.is_transient());
        assert!(BrokerError::BrokerGone.is_transient());
        assert!(!BrokerError::AlreadyWaiting.is_transient());
    }
}
