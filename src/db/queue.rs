//! Shared waiting slot and notice queue backed by SQLite.
//!
//! Several broker instances open the same database file. The slot row with
//! `slot = 0` is the occupant; claiming it flips `slot` to NULL in a single
//! `UPDATE ... RETURNING`, so SQLite's writer lock decides every race.
//!
//! A claim made by another instance leaves the row behind as a record for
//! the owner, which picks it up on its next [`NoticeRelay::drain`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::DbError;
use crate::metrics;
use crate::state::{
    ConnectionHandle, InstanceId, NoticeRelay, PeerAddress, RemoteNotice, SessionIdentity,
    WaitingEntry, WaitingSlot,
};

/// Notices older than this many leases are assumed undeliverable.
const NOTICE_RETENTION_LEASES: u32 = 10;

/// Queue store handle for one broker instance.
#[derive(Clone)]
pub struct SharedQueue {
    pool: SqlitePool,
    instance: InstanceId,
    lease: Duration,
}

type EntryRow = (String, String, i64, String);

impl SharedQueue {
    pub fn new(pool: SqlitePool, instance: InstanceId, lease: Duration) -> Self {
        Self {
            pool,
            instance,
            lease,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    fn lease_deadline(&self, now: i64) -> i64 {
        now.saturating_add(i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX))
    }

    /// Push the lease of every row this instance still has a use for.
    ///
    /// That is its occupant and the claims other instances made on it. A
    /// claim record this instance made on itself has no reader, so it is
    /// left to expire. Returns the number of rows renewed.
    pub async fn renew_leases(&self) -> Result<u64, DbError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE waiting_slot SET lease_expires_at = ?1
            WHERE owner_instance = ?2 AND (slot = 0 OR claimer_instance != ?2)
            "#,
        )
        .bind(self.lease_deadline(now))
        .bind(self.instance.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete rows whose owner stopped renewing them, and notices nobody
    /// drained.
    pub async fn reap_orphans(&self) -> Result<u64, DbError> {
        let now = now_millis();
        let entries = sqlx::query("DELETE FROM waiting_slot WHERE lease_expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let retention = self.lease.saturating_mul(NOTICE_RETENTION_LEASES);
        let cutoff = now.saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX));
        let notices = sqlx::query("DELETE FROM notices WHERE created_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let reaped = entries + notices;
        if reaped > 0 {
            metrics::record_reaped(reaped);
            debug!(entries, notices, "Reaped orphaned queue records");
        }
        Ok(reaped)
    }
}

#[async_trait]
impl WaitingSlot for SharedQueue {
    async fn try_occupy(&self, entry: &WaitingEntry) -> Result<bool, DbError> {
        let now = now_millis();

        // An expired occupant must not block the slot until the next sweep.
        let purged = sqlx::query("DELETE FROM waiting_slot WHERE slot = 0 AND lease_expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            metrics::record_reaped(purged);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO waiting_slot
                (id, handle, slot, peer_address, arrived_at, owner_instance, lease_expires_at)
            VALUES (?, ?, 0, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(entry.handle().to_string())
        .bind(entry.identity.peer_address.as_str())
        .bind(entry.identity.arrived_at.timestamp_millis())
        .bind(entry.instance.as_str())
        .bind(self.lease_deadline(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_claim(&self, claimer: &WaitingEntry) -> Result<Option<WaitingEntry>, DbError> {
        let now = now_millis();
        // The claim and, for a same-instance claim, the removal of its
        // record commit together. A record left behind would be renewed by
        // its owner and never drained.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (String, String, String, i64, String)>(
            r#"
            UPDATE waiting_slot
            SET slot = NULL,
                claimed_by = ?1,
                claimer_address = ?2,
                claimer_instance = ?3,
                claimer_arrived_at = ?4,
                claimed_at = ?5
            WHERE slot = 0 AND handle != ?1 AND lease_expires_at > ?5
            RETURNING id, handle, peer_address, arrived_at, owner_instance
            "#,
        )
        .bind(claimer.handle().to_string())
        .bind(claimer.identity.peer_address.as_str())
        .bind(claimer.instance.as_str())
        .bind(claimer.identity.arrived_at.timestamp_millis())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, handle, peer_address, arrived_at, owner)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        // Same instance: the claimer pairs both sides itself, nobody needs
        // the record.
        if owner == claimer.instance.as_str() {
            sqlx::query("DELETE FROM waiting_slot WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        entry_from_row((handle, peer_address, arrived_at, owner)).map(Some)
    }

    async fn vacate_if_owner(&self, handle: ConnectionHandle) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM waiting_slot WHERE handle = ? AND slot = 0")
            .bind(handle.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn occupant(&self) -> Result<Option<WaitingEntry>, DbError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT handle, peer_address, arrived_at, owner_instance
            FROM waiting_slot
            WHERE slot = 0 AND lease_expires_at > ?
            "#,
        )
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        row.map(entry_from_row).transpose()
    }

    fn backend(&self) -> &'static str {
        "shared"
    }
}

#[async_trait]
impl NoticeRelay for SharedQueue {
    async fn publish(&self, to: &InstanceId, notice: &RemoteNotice) -> Result<(), DbError> {
        let payload = serde_json::to_string(notice)?;
        sqlx::query(
            r#"
            INSERT INTO notices (recipient_instance, payload, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(to.as_str())
        .bind(payload)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn drain(&self, me: &InstanceId) -> Result<Vec<RemoteNotice>, DbError> {
        // One transaction, so a departure notice is never seen before the
        // claim that formed its pairing.
        let mut tx = self.pool.begin().await?;

        let mut claims = sqlx::query_as::<
            _,
            (
                String,
                Option<i64>,
                Option<String>,
                Option<String>,
                Option<i64>,
                Option<String>,
            ),
        >(
            r#"
            DELETE FROM waiting_slot
            WHERE owner_instance = ?1 AND slot IS NULL AND claimer_instance != ?1
            RETURNING handle, claimed_at, claimed_by, claimer_address, claimer_arrived_at, claimer_instance
            "#,
        )
        .bind(me.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut notices = sqlx::query_as::<_, (i64, String)>(
            r#"
            DELETE FROM notices
            WHERE recipient_instance = ?
            RETURNING id, payload
            "#,
        )
        .bind(me.as_str())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        claims.sort_by_key(|row| row.1);
        notices.sort_by_key(|(id, _)| *id);

        let mut drained = Vec::with_capacity(claims.len() + notices.len());
        for row in claims {
            let (waiting, _, Some(claimed_by), Some(address), Some(arrived_at), Some(instance)) =
                row
            else {
                warn!("Skipping claim record with missing claimer");
                continue;
            };
            let claimer = WaitingEntry {
                identity: identity_from_parts(&claimed_by, address, arrived_at)?,
                instance: InstanceId::new(instance),
            };
            drained.push(RemoteNotice::Claimed {
                waiting: parse_handle(&waiting)?,
                claimer,
            });
        }
        for (id, payload) in notices {
            match serde_json::from_str::<RemoteNotice>(&payload) {
                Ok(notice) => drained.push(notice),
                Err(e) => warn!(id, error = %e, "Skipping undecodable notice"),
            }
        }

        Ok(drained)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_handle(raw: &str) -> Result<ConnectionHandle, DbError> {
    raw.parse()
        .map_err(|_| DbError::Corrupt(format!("invalid connection handle {raw:?}")))
}

fn identity_from_parts(
    handle: &str,
    peer_address: String,
    arrived_at: i64,
) -> Result<SessionIdentity, DbError> {
    let peer_address = PeerAddress::parse(peer_address)
        .map_err(|e| DbError::Corrupt(format!("stored peer address: {e}")))?;
    let arrived_at = DateTime::from_timestamp_millis(arrived_at)
        .ok_or_else(|| DbError::Corrupt(format!("arrival time {arrived_at} out of range")))?;

    Ok(SessionIdentity {
        handle: parse_handle(handle)?,
        peer_address,
        arrived_at,
    })
}

fn entry_from_row((handle, peer_address, arrived_at, owner): EntryRow) -> Result<WaitingEntry, DbError> {
    Ok(WaitingEntry {
        identity: identity_from_parts(&handle, peer_address, arrived_at)?,
        instance: InstanceId::new(owner),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::BrokerError;
    use crate::state::{Departure, MatchOutcome, Matchmaker};
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    const LEASE: Duration = Duration::from_secs(30);

    fn entry_on(queue: &SharedQueue, addr: &str) -> WaitingEntry {
        WaitingEntry {
            identity: SessionIdentity::register(
                ConnectionHandle::generate(),
                PeerAddress::parse(addr).unwrap(),
            ),
            instance: queue.instance().clone(),
        }
    }

    async fn two_instances() -> (TempDir, SharedQueue, SharedQueue) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let path = path.to_str().unwrap();
        let alpha = Database::new(path).await.unwrap();
        let beta = Database::new(path).await.unwrap();
        (
            dir,
            alpha.queue(InstanceId::new("alpha"), LEASE),
            beta.queue(InstanceId::new("beta"), LEASE),
        )
    }

    #[tokio::test]
    async fn test_slot_holds_one_occupant_across_instances() {
        let (_dir, alpha, beta) = two_instances().await;
        let a = entry_on(&alpha, "peer-a");
        let b = entry_on(&beta, "peer-b");

        assert!(alpha.try_occupy(&a).await.unwrap());
        assert!(!beta.try_occupy(&b).await.unwrap());
        assert_eq!(beta.occupant().await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_local_claim_leaves_no_record() {
        let (_dir, alpha, _beta) = two_instances().await;
        let a = entry_on(&alpha, "peer-a");
        let b = entry_on(&alpha, "peer-b");

        alpha.try_occupy(&a).await.unwrap();
        assert_eq!(alpha.try_claim(&b).await.unwrap(), Some(a.clone()));
        assert!(alpha.occupant().await.unwrap().is_none());
        assert!(alpha.drain(alpha.instance()).await.unwrap().is_empty());
        assert!(!alpha.vacate_if_owner(a.handle()).await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_claim_is_drained_by_owner_once() {
        let (_dir, alpha, beta) = two_instances().await;
        let a = entry_on(&alpha, "peer-a");
        let b = entry_on(&beta, "peer-b");

        alpha.try_occupy(&a).await.unwrap();
        assert_eq!(beta.try_claim(&b).await.unwrap(), Some(a.clone()));

        // Claimed rows belong to the owner, not the claimer.
        assert!(beta.drain(beta.instance()).await.unwrap().is_empty());

        let drained = alpha.drain(alpha.instance()).await.unwrap();
        assert_eq!(
            drained,
            vec![RemoteNotice::Claimed {
                waiting: a.handle(),
                claimer: b,
            }]
        );
        assert!(alpha.drain(alpha.instance()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cannot_claim_self() {
        let (_dir, alpha, _beta) = two_instances().await;
        let a = entry_on(&alpha, "peer-a");
        alpha.try_occupy(&a).await.unwrap();
        assert!(alpha.try_claim(&a).await.unwrap().is_none());
        assert!(alpha.vacate_if_owner(a.handle()).await.unwrap());
    }

    #[tokio::test]
    async fn test_notices_drain_in_publish_order() {
        let (_dir, alpha, beta) = two_instances().await;
        let recipient = ConnectionHandle::generate();
        let first = RemoteNotice::PartnerLeft {
            recipient,
            partner: ConnectionHandle::generate(),
            departure: Departure::Ended,
        };
        let second = RemoteNotice::PartnerLeft {
            recipient,
            partner: ConnectionHandle::generate(),
            departure: Departure::Disconnected,
        };

        beta.publish(alpha.instance(), &first).await.unwrap();
        beta.publish(alpha.instance(), &second).await.unwrap();

        assert!(beta.drain(beta.instance()).await.unwrap().is_empty());
        assert_eq!(
            alpha.drain(alpha.instance()).await.unwrap(),
            vec![first, second]
        );
    }

    #[tokio::test]
    async fn test_expired_occupant_is_not_claimable_and_gets_reaped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let db = Database::new(path.to_str().unwrap()).await.unwrap();
        let dead = db.queue(InstanceId::new("dead"), Duration::ZERO);
        let live = db.queue(InstanceId::new("live"), LEASE);

        assert!(dead.try_occupy(&entry_on(&dead, "peer-a")).await.unwrap());
        assert!(live.try_claim(&entry_on(&live, "peer-b")).await.unwrap().is_none());
        assert!(live.occupant().await.unwrap().is_none());
        assert_eq!(live.reap_orphans().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_occupant_does_not_block_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        let db = Database::new(path.to_str().unwrap()).await.unwrap();
        let dead = db.queue(InstanceId::new("dead"), Duration::ZERO);
        let live = db.queue(InstanceId::new("live"), LEASE);

        dead.try_occupy(&entry_on(&dead, "peer-a")).await.unwrap();
        let b = entry_on(&live, "peer-b");
        assert!(live.try_occupy(&b).await.unwrap());
        assert_eq!(live.occupant().await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_renew_touches_only_own_rows() {
        let (_dir, alpha, beta) = two_instances().await;
        alpha.try_occupy(&entry_on(&alpha, "peer-a")).await.unwrap();

        assert_eq!(alpha.renew_leases().await.unwrap(), 1);
        assert_eq!(beta.renew_leases().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_self_claim_record_is_not_renewed_and_expires() {
        let (_dir, alpha, beta) = two_instances().await;
        let a = entry_on(&alpha, "peer-a");
        alpha.try_occupy(&a).await.unwrap();

        // A same-instance claim whose record was never removed.
        sqlx::query(
            r#"
            UPDATE waiting_slot
            SET slot = NULL, claimed_by = 'x', claimer_address = 'peer-x',
                claimer_instance = owner_instance, claimer_arrived_at = 0,
                claimed_at = 0, lease_expires_at = 0
            "#,
        )
        .execute(&alpha.pool)
        .await
        .unwrap();

        assert_eq!(alpha.renew_leases().await.unwrap(), 0);
        assert!(alpha.drain(alpha.instance()).await.unwrap().is_empty());
        assert_eq!(beta.reap_orphans().await.unwrap(), 1);

        // The handle is free to wait again.
        assert!(alpha.try_occupy(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_claim_record_is_renewed_until_drained() {
        let (_dir, alpha, beta) = two_instances().await;
        alpha.try_occupy(&entry_on(&alpha, "peer-a")).await.unwrap();
        beta.try_claim(&entry_on(&beta, "peer-b")).await.unwrap();

        assert_eq!(alpha.renew_leases().await.unwrap(), 1);
        assert_eq!(alpha.drain(alpha.instance()).await.unwrap().len(), 1);
        assert_eq!(alpha.renew_leases().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_find_partner_across_instances() {
        for n in [2usize, 9, 40] {
            let (_dir, alpha, beta) = two_instances().await;
            let instances = [alpha.instance().clone(), beta.instance().clone()];
            let matchmakers = [
                Arc::new(Matchmaker::new(Arc::new(alpha.clone()), instances[0].clone(), 1)),
                Arc::new(Matchmaker::new(Arc::new(beta.clone()), instances[1].clone(), 1)),
            ];

            let mut tasks = Vec::new();
            for i in 0..n {
                let mm = matchmakers[i % 2].clone();
                let queue = if i % 2 == 0 { alpha.clone() } else { beta.clone() };
                tasks.push(tokio::spawn(async move {
                    let me = entry_on(&queue, &format!("peer-{i}"));
                    loop {
                        match mm.find_partner(&me.identity).await {
                            Err(BrokerError::ContentionExceeded { .. }) => {
                                tokio::task::yield_now().await
                            }
                            other => return (me.handle(), other.unwrap()),
                        }
                    }
                }));
            }

            let mut waited = HashSet::new();
            let mut claimed = HashSet::new();
            let mut pairings = 0;
            for task in tasks {
                let (handle, outcome) = task.await.unwrap();
                match outcome {
                    MatchOutcome::Waiting => {
                        waited.insert(handle);
                    }
                    MatchOutcome::Paired { partner, .. } => {
                        pairings += 1;
                        assert!(claimed.insert(partner.handle()), "partner claimed twice");
                    }
                }
            }

            assert_eq!(pairings, n / 2, "n = {n}");
            assert!(claimed.is_subset(&waited));
            let leftover = alpha.occupant().await.unwrap();
            assert_eq!(leftover.is_some(), n % 2 == 1);
            if let Some(entry) = leftover {
                assert!(waited.contains(&entry.handle()) && !claimed.contains(&entry.handle()));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_across_instances_take_occupant_once() {
        let (_dir, alpha, beta) = two_instances().await;
        alpha.try_occupy(&entry_on(&alpha, "peer-a")).await.unwrap();

        let queues = [Arc::new(alpha), Arc::new(beta)];
        let mut tasks = Vec::new();
        for i in 0..8 {
            let queue = queues[i % 2].clone();
            tasks.push(tokio::spawn(async move {
                let claimer = entry_on(&queue, &format!("peer-{i}"));
                queue.try_claim(&claimer).await.unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
