//! The Waiting Slot: the single place a party waits for a partner.
//!
//! Every backend exposes only atomic primitives. Callers never read the
//! occupant and then act on it; a claim either takes the occupant or it
//! does not, and a vacate either removes the caller's own entry or finds
//! that a claim already won.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::db::DbError;
use crate::state::{ConnectionHandle, InstanceId, SessionIdentity};

/// A party in (or entering) the waiting slot, with the broker instance that
/// owns its connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WaitingEntry {
    pub identity: SessionIdentity,
    pub instance: InstanceId,
}

impl WaitingEntry {
    pub fn handle(&self) -> ConnectionHandle {
        self.identity.handle
    }
}

/// Atomic operations over the waiting slot.
#[async_trait]
pub trait WaitingSlot: Send + Sync {
    /// Place `entry` in the slot if it is empty. Returns `false` when
    /// another party got there first.
    async fn try_occupy(&self, entry: &WaitingEntry) -> Result<bool, DbError>;

    /// Take the occupant, if there is one other than `claimer` itself.
    ///
    /// Two concurrent claims against the same occupant never both succeed.
    async fn try_claim(&self, claimer: &WaitingEntry) -> Result<Option<WaitingEntry>, DbError>;

    /// Remove the occupant only if it is `handle`. Returns `false` when the
    /// slot holds someone else, is empty, or the entry was already claimed.
    async fn vacate_if_owner(&self, handle: ConnectionHandle) -> Result<bool, DbError>;

    /// Current occupant, for diagnostics only.
    async fn occupant(&self) -> Result<Option<WaitingEntry>, DbError>;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}

/// In-process waiting slot for a single broker instance.
#[derive(Debug, Default)]
pub struct MemorySlot {
    occupant: Mutex<Option<WaitingEntry>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitingSlot for MemorySlot {
    async fn try_occupy(&self, entry: &WaitingEntry) -> Result<bool, DbError> {
        let mut occupant = self.occupant.lock();
        if occupant.is_some() {
            return Ok(false);
        }
        *occupant = Some(entry.clone());
        Ok(true)
    }

    async fn try_claim(&self, claimer: &WaitingEntry) -> Result<Option<WaitingEntry>, DbError> {
        let mut occupant = self.occupant.lock();
        match occupant.as_ref() {
            Some(current) if current.handle() != claimer.handle() => Ok(occupant.take()),
            _ => Ok(None),
        }
    }

    async fn vacate_if_owner(&self, handle: ConnectionHandle) -> Result<bool, DbError> {
        let mut occupant = self.occupant.lock();
        match occupant.as_ref() {
            Some(current) if current.handle() == handle => {
                *occupant = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn occupant(&self) -> Result<Option<WaitingEntry>, DbError> {
        Ok(self.occupant.lock().clone())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
