//! Notices exchanged between broker instances sharing a queue store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::DbError;
use crate::state::{ConnectionHandle, Departure, InstanceId, WaitingEntry};

/// Something another broker instance did that concerns one of our sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteNotice {
    /// `claimer` took our waiting session `waiting` out of the slot.
    Claimed {
        waiting: ConnectionHandle,
        claimer: WaitingEntry,
    },
    /// `partner` left the pairing it shared with our session `recipient`.
    PartnerLeft {
        recipient: ConnectionHandle,
        partner: ConnectionHandle,
        departure: Departure,
    },
}

impl RemoteNotice {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Claimed { .. } => "claimed",
            Self::PartnerLeft { .. } => "partner_left",
        }
    }
}

/// Delivery of [`RemoteNotice`]s to the instance that owns the recipient.
#[async_trait]
pub trait NoticeRelay: Send + Sync {
    async fn publish(&self, to: &InstanceId, notice: &RemoteNotice) -> Result<(), DbError>;

    /// Take every notice pending for `me`, oldest first.
    async fn drain(&self, me: &InstanceId) -> Result<Vec<RemoteNotice>, DbError>;
}

/// Relay for a standalone broker. Every session is local, so nothing should
/// ever be published.
#[derive(Debug, Default)]
pub struct LocalRelay;

#[async_trait]
impl NoticeRelay for LocalRelay {
    async fn publish(&self, to: &InstanceId, notice: &RemoteNotice) -> Result<(), DbError> {
        warn!(instance = %to, notice = notice.name(), "Dropping notice for remote instance without a shared store");
        Ok(())
    }

    async fn drain(&self, _me: &InstanceId) -> Result<Vec<RemoteNotice>, DbError> {
        Ok(Vec::new())
    }
}
