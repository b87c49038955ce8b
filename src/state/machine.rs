//! Per-session lifecycle state machine.
//!
//! ```text
//!            find_partner            claimed by a later arrival
//!  ┌──────┐ ──────────────► ┌─────────┐ ─────────────────────► ┌────────┐
//!  │ Idle │   (slot empty)  │ Waiting │                        │ Paired │
//!  └──────┘ ◄────────────── └─────────┘                        └────────┘
//!     ▲ ▲     cancel_search                                         │
//!     │ └───────────────────────────────────────────────────────────┤
//!     │    end_session / partner left / terminal peer state         │
//!     └─────────────────────────────────────────────────────────────┘
//!                    find_partner (claimed the occupant)
//! ```
//!
//! [`transition`] is a pure function from the current [`Phase`] and a
//! [`Trigger`] to the next phase plus the [`Effect`]s the lifecycle manager
//! must carry out. It never touches the slot, the pairing book or a socket.

use rendezvous_proto::{PeerConnectionState, Role, ServerMessage};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::state::PeerAddress;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Waiting,
    Paired {
        /// The client reported its peer connection as established.
        connected: bool,
    },
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Paired { .. } => "paired",
        }
    }
}

/// Why a party left its pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Departure {
    /// Asked to end the session, or its peer connection closed.
    Ended,
    /// Its connection to the broker dropped.
    Disconnected,
    /// Its peer connection to the partner could not be established.
    Unreachable,
}

impl Departure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ended => "ended",
            Self::Disconnected => "disconnected",
            Self::Unreachable => "unreachable",
        }
    }

    /// What the remaining partner is told, if anything.
    pub fn partner_notice(self) -> Option<ServerMessage> {
        match self {
            Self::Ended => Some(ServerMessage::PartnerDisconnected { involuntary: false }),
            Self::Disconnected => Some(ServerMessage::PartnerDisconnected { involuntary: true }),
            // Only the reporting side hears about it.
            Self::Unreachable => None,
        }
    }
}

/// Events that drive a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Client asked for a partner.
    FindPartner,
    /// The matchmaker put the session in the slot.
    Queued,
    /// A pairing was formed with this session in `role`.
    Matched {
        role: Role,
        partner_address: PeerAddress,
    },
    /// Client asked to stop waiting.
    Cancel,
    /// Client asked to leave its pairing.
    End,
    /// Client connection dropped.
    Disconnect,
    /// Client reported a peer connection state change.
    PeerState(PeerConnectionState),
    /// The partner left the pairing.
    PartnerLeft(Departure),
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindPartner => "find_partner",
            Self::Queued => "queued",
            Self::Matched { .. } => "matched",
            Self::Cancel => "cancel_search",
            Self::End => "end_session",
            Self::Disconnect => "disconnect",
            Self::PeerState(_) => "peer_state",
            Self::PartnerLeft(_) => "partner_left",
        }
    }
}

/// Side effects requested by a transition, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Run the matchmaker for this session.
    Search,
    /// Remove this session's entry from the waiting slot.
    Vacate,
    /// Dissolve this session's pairing and inform the partner.
    TearDown(Departure),
    /// Send a frame to this session's client.
    Notify(ServerMessage),
    /// Forget the session entirely.
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: Phase, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

/// Compute the next phase for `trigger`.
///
/// Client requests that make no sense in the current phase are rejected
/// with the matching [`BrokerError`] and the phase is left as it was.
pub fn transition(phase: Phase, trigger: &Trigger) -> Result<Transition, BrokerError> {
    use Phase::*;

    let t = match (phase, trigger) {
        (Idle, Trigger::FindPartner) => Transition::to(Idle, vec![Effect::Search]),
        (Waiting | Paired { .. }, Trigger::FindPartner) => return Err(BrokerError::AlreadyWaiting),

        (Idle, Trigger::Queued) => {
            Transition::to(Waiting, vec![Effect::Notify(ServerMessage::Waiting)])
        }

        (Idle | Waiting, Trigger::Matched { role, partner_address }) => Transition::to(
            Paired { connected: false },
            vec![Effect::Notify(ServerMessage::paired(
                *role,
                partner_address.as_str(),
            ))],
        ),

        (Waiting, Trigger::Cancel) => Transition::to(
            Idle,
            vec![Effect::Vacate, Effect::Notify(ServerMessage::SearchCancelled)],
        ),
        (_, Trigger::Cancel) => return Err(BrokerError::NotWaiting),

        (Paired { .. }, Trigger::End) => Transition::to(
            Idle,
            vec![
                Effect::TearDown(Departure::Ended),
                Effect::Notify(ServerMessage::SessionEnded),
            ],
        ),
        (_, Trigger::End) => return Err(BrokerError::NotPaired),

        (Idle, Trigger::Disconnect) => Transition::to(Idle, vec![Effect::Release]),
        (Waiting, Trigger::Disconnect) => {
            Transition::to(Idle, vec![Effect::Vacate, Effect::Release])
        }
        (Paired { .. }, Trigger::Disconnect) => Transition::to(
            Idle,
            vec![Effect::TearDown(Departure::Disconnected), Effect::Release],
        ),

        (Paired { connected }, Trigger::PeerState(state)) => match *state {
            PeerConnectionState::Connected => {
                Transition::to(Paired { connected: true }, Vec::new())
            }
            // Reported back to the caller as `PartnerUnreachable`.
            PeerConnectionState::Failed if !connected => {
                Transition::to(Idle, vec![Effect::TearDown(Departure::Unreachable)])
            }
            state if state.is_terminal() => Transition::to(
                Idle,
                vec![
                    Effect::TearDown(Departure::Ended),
                    Effect::Notify(ServerMessage::SessionEnded),
                ],
            ),
            _ => Transition::to(phase, Vec::new()),
        },
        (_, Trigger::PeerState(_)) => return Err(BrokerError::NotPaired),

        (Paired { .. }, Trigger::PartnerLeft(departure)) => Transition::to(
            Idle,
            departure.partner_notice().map(Effect::Notify).into_iter().collect(),
        ),
        (_, Trigger::PartnerLeft(_)) => return Err(BrokerError::NotPaired),

        (Waiting | Paired { .. }, Trigger::Queued) | (Paired { .. }, Trigger::Matched { .. }) => {
            return Err(BrokerError::InvalidTransition {
                phase: phase.name(),
                trigger: trigger.name(),
            });
        }
    };

    Ok(t)
}
