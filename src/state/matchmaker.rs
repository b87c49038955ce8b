//! Pairs each arriving party with whoever is waiting.
//!
//! `find_partner` first tries to claim the current occupant; if the slot is
//! empty it tries to occupy it. Between those two steps another party can
//! slip in, so the pair of steps is retried a bounded number of times before
//! giving up with [`BrokerError::ContentionExceeded`].

use std::sync::Arc;

use rendezvous_proto::Role;
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::metrics;
use crate::state::{ConnectionHandle, InstanceId, SessionIdentity, WaitingEntry, WaitingSlot};

/// Result of a successful `find_partner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The caller claimed `partner` and takes `role`.
    Paired { role: Role, partner: WaitingEntry },
    /// The caller now occupies the slot.
    Waiting,
}

pub struct Matchmaker {
    slot: Arc<dyn WaitingSlot>,
    instance: InstanceId,
    claim_retries: u32,
}

impl Matchmaker {
    pub fn new(slot: Arc<dyn WaitingSlot>, instance: InstanceId, claim_retries: u32) -> Self {
        Self {
            slot,
            instance,
            claim_retries,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn backend(&self) -> &'static str {
        self.slot.backend()
    }

    /// Claim the waiting party or take its place.
    ///
    /// The caller always ends up either paired (as initiator) or waiting,
    /// unless the slot stays contended for `claim_retries + 1` attempts.
    pub async fn find_partner(
        &self,
        identity: &SessionIdentity,
    ) -> Result<MatchOutcome, BrokerError> {
        let me = WaitingEntry {
            identity: identity.clone(),
            instance: self.instance.clone(),
        };
        let attempts = self.claim_retries.saturating_add(1);

        for attempt in 1..=attempts {
            if let Some(partner) = self.slot.try_claim(&me).await? {
                debug!(
                    handle = %identity.handle,
                    partner = %partner.handle(),
                    partner_instance = %partner.instance,
                    "Claimed waiting party"
                );
                return Ok(MatchOutcome::Paired {
                    role: Role::Initiator,
                    partner,
                });
            }

            if self.slot.try_occupy(&me).await? {
                return Ok(MatchOutcome::Waiting);
            }

            metrics::record_claim_contention();
            warn!(handle = %identity.handle, attempt, attempts, "Waiting slot contended");
        }

        let occupant = self.slot.occupant().await.ok().flatten();
        warn!(
            handle = %identity.handle,
            occupant = ?occupant.as_ref().map(WaitingEntry::handle),
            "Giving up on contended waiting slot"
        );
        Err(BrokerError::ContentionExceeded { attempts })
    }

    /// Leave the slot if `handle` still occupies it.
    ///
    /// `Ok(false)` means the entry was already claimed (or never there); the
    /// caller must expect a pairing for it instead.
    pub async fn cancel(&self, handle: ConnectionHandle) -> Result<bool, BrokerError> {
        Ok(self.slot.vacate_if_owner(handle).await?)
    }

    #[cfg(test)]
    pub async fn occupant(&self) -> Result<Option<WaitingEntry>, BrokerError> {
        Ok(self.slot.occupant().await?)
    }
}
