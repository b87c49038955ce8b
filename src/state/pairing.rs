//! Active pairings known to this broker instance.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rendezvous_proto::Role;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::state::{ConnectionHandle, InstanceId, SessionIdentity, WaitingEntry};

/// One side of a pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedParty {
    pub identity: SessionIdentity,
    pub instance: InstanceId,
}

impl PairedParty {
    pub fn handle(&self) -> ConnectionHandle {
        self.identity.handle
    }
}

impl From<WaitingEntry> for PairedParty {
    fn from(entry: WaitingEntry) -> Self {
        Self {
            identity: entry.identity,
            instance: entry.instance,
        }
    }
}

/// Two parties matched for one peer-to-peer session. The initiator dials,
/// the receiver answers.
#[derive(Debug, Clone)]
pub struct Pairing {
    pub id: Uuid,
    pub initiator: PairedParty,
    pub receiver: PairedParty,
    pub established_at: DateTime<Utc>,
}

impl Pairing {
    pub fn new(initiator: PairedParty, receiver: PairedParty) -> Self {
        Self {
            id: Uuid::new_v4(),
            initiator,
            receiver,
            established_at: Utc::now(),
        }
    }

    pub fn role_of(&self, handle: ConnectionHandle) -> Option<Role> {
        if self.initiator.handle() == handle {
            Some(Role::Initiator)
        } else if self.receiver.handle() == handle {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    /// The other side from `handle`'s point of view.
    pub fn partner_of(&self, handle: ConnectionHandle) -> Option<&PairedParty> {
        match self.role_of(handle)? {
            Role::Initiator => Some(&self.receiver),
            Role::Receiver => Some(&self.initiator),
        }
    }
}

/// Index of active pairings, keyed by pairing id and by member handle.
///
/// A handle belongs to at most one pairing; [`PairingBook::insert`] refuses
/// anything else.
#[derive(Debug, Default)]
pub struct PairingBook {
    pairings: HashMap<Uuid, Pairing>,
    by_member: HashMap<ConnectionHandle, Uuid>,
}

impl PairingBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pairing: Pairing) -> Result<&Pairing, BrokerError> {
        for handle in [pairing.initiator.handle(), pairing.receiver.handle()] {
            if self.by_member.contains_key(&handle) {
                return Err(BrokerError::DuplicatePairing(handle));
            }
        }
        if pairing.initiator.handle() == pairing.receiver.handle() {
            return Err(BrokerError::DuplicatePairing(pairing.initiator.handle()));
        }

        let id = pairing.id;
        self.by_member.insert(pairing.initiator.handle(), id);
        self.by_member.insert(pairing.receiver.handle(), id);
        Ok(self.pairings.entry(id).or_insert(pairing))
    }

    pub fn get_by_member(&self, handle: ConnectionHandle) -> Option<&Pairing> {
        let id = self.by_member.get(&handle)?;
        self.pairings.get(id)
    }

    /// Dissolve the pairing `handle` belongs to.
    pub fn remove_by_member(&mut self, handle: ConnectionHandle) -> Option<Pairing> {
        let id = self.by_member.remove(&handle)?;
        let pairing = self.pairings.remove(&id)?;
        if let Some(partner) = pairing.partner_of(handle) {
            self.by_member.remove(&partner.handle());
        }
        Some(pairing)
    }

    pub fn len(&self) -> usize {
        self.pairings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairings.is_empty()
    }
}
