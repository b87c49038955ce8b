//! Matchmaking state.
//!
//! Contains the waiting slot, the matchmaker, the per-session state machine
//! and the broker actor that ties them together.

mod broker;
mod identity;
mod lifecycle;
mod machine;
mod matchmaker;
mod pairing;
mod relay;
pub(crate) mod slot;

pub use broker::{Broker, BrokerHandle};
pub use identity::{ConnectionHandle, InstanceId, PeerAddress, SessionIdentity};
pub use lifecycle::{BrokerSnapshot, Lifecycle};
pub use machine::Departure;
pub use matchmaker::{MatchOutcome, Matchmaker};
pub use pairing::{PairedParty, Pairing, PairingBook};
pub use relay::{LocalRelay, NoticeRelay, RemoteNotice};
pub use slot::{MemorySlot, WaitingEntry, WaitingSlot};
