//! Session lifecycle manager.
//!
//! Owns every session attached to this broker instance and the pairings
//! they belong to. Each client event is turned into a [`Trigger`], run
//! through [`machine::transition`], and the resulting [`Effect`]s are carried
//! out here: matchmaking, vacating the slot, tearing down pairings and
//! queueing frames on the client's outbox.
//!
//! The lifecycle is not thread-safe on purpose; the broker actor owns it and
//! feeds it one event at a time.

use std::collections::HashMap;
use std::sync::Arc;

use rendezvous_proto::{PeerConnectionState, Role, ServerMessage};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::metrics;
use crate::state::machine::{self, Departure, Effect, Phase, Transition, Trigger};
use crate::state::{
    ConnectionHandle, InstanceId, MatchOutcome, Matchmaker, NoticeRelay, PairedParty, Pairing,
    PairingBook, PeerAddress, RemoteNotice, SessionIdentity,
};

/// How many stale entries a single search may discard before giving up.
const MAX_STALE_CLAIMS: u32 = 8;

/// A client connection as the broker sees it.
#[derive(Debug)]
struct Session {
    /// Dropped when a session frame could not be queued, which closes the
    /// client's connection.
    outbox: Option<mpsc::Sender<ServerMessage>>,
    phase: Phase,
    /// Registered on `find_partner`, cleared whenever the session goes idle.
    identity: Option<SessionIdentity>,
}

/// Point-in-time counts for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSnapshot {
    pub instance: InstanceId,
    pub sessions: usize,
    pub waiting: usize,
    pub pairings: usize,
}

pub struct Lifecycle {
    sessions: HashMap<ConnectionHandle, Session>,
    pairings: PairingBook,
    matchmaker: Matchmaker,
    relay: Arc<dyn NoticeRelay>,
}

impl Lifecycle {
    pub fn new(matchmaker: Matchmaker, relay: Arc<dyn NoticeRelay>) -> Self {
        Self {
            sessions: HashMap::new(),
            pairings: PairingBook::new(),
            matchmaker,
            relay,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        self.matchmaker.instance()
    }

    /// Start tracking a connection. Frames for it go to `outbox`.
    pub fn attach(&mut self, handle: ConnectionHandle, outbox: mpsc::Sender<ServerMessage>) {
        let session = Session {
            outbox: Some(outbox),
            phase: Phase::Idle,
            identity: None,
        };
        if self.sessions.insert(handle, session).is_some() {
            warn!(handle = %handle, "Replaced existing session for handle");
        }
        self.refresh_gauges();
    }

    pub async fn find_partner(
        &mut self,
        handle: ConnectionHandle,
        peer_address: String,
    ) -> BrokerResult {
        let effects = self.advance(handle, &Trigger::FindPartner)?;
        let peer_address = PeerAddress::parse(peer_address)?;
        if let Some(session) = self.sessions.get_mut(&handle) {
            session.identity = Some(SessionIdentity::register(handle, peer_address));
        }
        let result = self.run_effects(handle, effects).await.map(|_| ());
        self.refresh_gauges();
        result
    }

    pub async fn cancel_search(&mut self, handle: ConnectionHandle) -> BrokerResult {
        self.run(handle, Trigger::Cancel).await?;
        metrics::record_search_cancelled();
        self.refresh_gauges();
        Ok(())
    }

    pub async fn end_session(&mut self, handle: ConnectionHandle) -> BrokerResult {
        self.run(handle, Trigger::End).await?;
        self.refresh_gauges();
        Ok(())
    }

    /// Apply a peer connection state reported by the client.
    ///
    /// A failure before the connection was ever established comes back as
    /// [`BrokerError::PartnerUnreachable`] after the pairing is dissolved.
    pub async fn peer_state(
        &mut self,
        handle: ConnectionHandle,
        state: PeerConnectionState,
    ) -> BrokerResult {
        let departed = self.run(handle, Trigger::PeerState(state)).await?;
        self.refresh_gauges();
        match departed {
            Some(Departure::Unreachable) => Err(BrokerError::PartnerUnreachable),
            _ => Ok(()),
        }
    }

    /// The connection is gone. Never fails; whatever the session held is
    /// released.
    pub async fn on_disconnect(&mut self, handle: ConnectionHandle) {
        match self.run(handle, Trigger::Disconnect).await {
            Ok(_) => debug!(handle = %handle, "Session released"),
            Err(BrokerError::UnknownSession(_)) => {
                debug!(handle = %handle, "Disconnect for unknown session")
            }
            Err(e) => {
                warn!(handle = %handle, error = %e, "Disconnect cleanup failed");
                self.sessions.remove(&handle);
            }
        }
        self.refresh_gauges();
    }

    /// Apply a notice from another broker instance.
    pub async fn on_remote(&mut self, notice: RemoteNotice) {
        metrics::record_remote_notice(notice.name());
        match notice {
            RemoteNotice::Claimed { waiting, claimer } => {
                let receiver = self
                    .sessions
                    .get(&waiting)
                    .filter(|s| s.phase == Phase::Waiting)
                    .and_then(|s| s.identity.clone());

                match receiver {
                    Some(identity) => {
                        let receiver = PairedParty {
                            identity,
                            instance: self.instance().clone(),
                        };
                        if let Err(e) = self.pair(claimer.into(), receiver) {
                            error!(handle = %waiting, error = %e, "Failed to pair with remote claimer");
                        }
                    }
                    None => {
                        // The initiator must not keep dialing someone who left.
                        warn!(
                            handle = %waiting,
                            claimer = %claimer.handle(),
                            "Claimed session is no longer waiting"
                        );
                        let bounce = RemoteNotice::PartnerLeft {
                            recipient: claimer.handle(),
                            partner: waiting,
                            departure: Departure::Disconnected,
                        };
                        self.send_remote(&claimer.instance, bounce).await;
                    }
                }
            }
            RemoteNotice::PartnerLeft {
                recipient,
                partner,
                departure,
            } => self.on_partner_left(recipient, partner, departure),
        }
        self.refresh_gauges();
    }

    /// Disconnect every session before the broker stops.
    pub async fn shutdown(&mut self) {
        let handles: Vec<_> = self.sessions.keys().copied().collect();
        info!(sessions = handles.len(), "Releasing all sessions");
        for handle in handles {
            self.on_disconnect(handle).await;
        }
        if !self.pairings.is_empty() {
            warn!(pairings = self.pairings.len(), "Pairings left after releasing every session");
        }
    }

    /// Queue a frame for a client, if it is still attached.
    ///
    /// A full outbox drops keepalive and error frames. Any other frame
    /// changes what the client believes about its session, so losing one
    /// cuts the client off instead; its disconnect then tears the session
    /// down like any other.
    pub fn reply(&mut self, handle: ConnectionHandle, msg: ServerMessage) {
        let Some(session) = self.sessions.get_mut(&handle) else {
            return;
        };
        let Some(outbox) = &session.outbox else {
            debug!(handle = %handle, frame = ?msg, "Client cut off, dropping frame");
            return;
        };
        match outbox.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                metrics::record_dropped_frame();
                if is_session_frame(&msg) {
                    warn!(handle = %handle, frame = ?msg, "Outbox full, cutting client off");
                    session.outbox = None;
                } else {
                    warn!(handle = %handle, frame = ?msg, "Outbox full, dropping frame");
                }
            }
            Err(TrySendError::Closed(_)) => debug!(handle = %handle, "Outbox closed"),
        }
    }

    #[cfg(test)]
    pub fn phase(&self, handle: ConnectionHandle) -> Option<Phase> {
        self.sessions.get(&handle).map(|s| s.phase)
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            instance: self.instance().clone(),
            sessions: self.sessions.len(),
            waiting: self
                .sessions
                .values()
                .filter(|s| s.phase == Phase::Waiting)
                .count(),
            pairings: self.pairings.len(),
        }
    }

    // ------------------------------------------------------------------
    // Transition plumbing
    // ------------------------------------------------------------------

    async fn run(
        &mut self,
        handle: ConnectionHandle,
        trigger: Trigger,
    ) -> Result<Option<Departure>, BrokerError> {
        let effects = self.advance(handle, &trigger)?;
        self.run_effects(handle, effects).await
    }

    /// Move `handle` to its next phase and hand back the effects to run.
    fn advance(
        &mut self,
        handle: ConnectionHandle,
        trigger: &Trigger,
    ) -> Result<Vec<Effect>, BrokerError> {
        let session = self
            .sessions
            .get_mut(&handle)
            .ok_or(BrokerError::UnknownSession(handle))?;

        let Transition { next, effects } = machine::transition(session.phase, trigger)?;
        if next != session.phase {
            debug!(
                handle = %handle,
                from = session.phase.name(),
                to = next.name(),
                trigger = trigger.name(),
                "Session transition"
            );
        }
        session.phase = next;
        if next == Phase::Idle {
            session.identity = None;
        }
        Ok(effects)
    }

    /// Returns the departure of any pairing torn down along the way.
    async fn run_effects(
        &mut self,
        handle: ConnectionHandle,
        effects: Vec<Effect>,
    ) -> Result<Option<Departure>, BrokerError> {
        let mut departed = None;
        for effect in effects {
            match effect {
                Effect::Search => self.search(handle).await?,
                Effect::Vacate => self.vacate(handle).await,
                Effect::TearDown(departure) => {
                    self.tear_down(handle, departure).await;
                    departed = Some(departure);
                }
                Effect::Notify(msg) => self.reply(handle, msg),
                Effect::Release => {
                    self.sessions.remove(&handle);
                }
            }
        }
        Ok(departed)
    }

    /// Apply a trigger that can only produce frames, such as a partner's
    /// pairing or departure.
    fn deliver(&mut self, handle: ConnectionHandle, trigger: Trigger) -> BrokerResult {
        for effect in self.advance(handle, &trigger)? {
            match effect {
                Effect::Notify(msg) => self.reply(handle, msg),
                other => warn!(handle = %handle, effect = ?other, "Ignoring unexpected effect"),
            }
        }
        Ok(())
    }

    fn is_waiting_locally(&self, handle: ConnectionHandle) -> bool {
        self.sessions
            .get(&handle)
            .is_some_and(|s| s.phase == Phase::Waiting)
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    async fn search(&mut self, handle: ConnectionHandle) -> BrokerResult {
        let identity = self
            .sessions
            .get(&handle)
            .and_then(|s| s.identity.clone())
            .ok_or(BrokerError::UnknownSession(handle))?;

        for _ in 0..MAX_STALE_CLAIMS {
            let outcome = match self.matchmaker.find_partner(&identity).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.forget_identity(handle);
                    return Err(e);
                }
            };

            match outcome {
                MatchOutcome::Waiting => {
                    self.deliver(handle, Trigger::Queued)?;
                    info!(
                        handle = %handle,
                        backend = self.matchmaker.backend(),
                        "Waiting for a partner"
                    );
                    return Ok(());
                }
                MatchOutcome::Paired { partner, .. } => {
                    // A local entry whose session is not waiting any more is
                    // left over from a lost race; the claim already removed it.
                    if partner.instance == *self.instance() && !self.is_waiting_locally(partner.handle()) {
                        warn!(handle = %handle, stale = %partner.handle(), "Discarded stale waiting entry");
                        metrics::record_stale_entry();
                        continue;
                    }

                    let initiator = PairedParty {
                        identity,
                        instance: self.instance().clone(),
                    };
                    return self.pair(initiator, partner.into());
                }
            }
        }

        self.forget_identity(handle);
        Err(BrokerError::ContentionExceeded {
            attempts: MAX_STALE_CLAIMS,
        })
    }

    fn forget_identity(&mut self, handle: ConnectionHandle) {
        if let Some(session) = self.sessions.get_mut(&handle) {
            session.identity = None;
        }
    }

    /// Record a pairing and tell whichever sides live on this instance.
    fn pair(&mut self, initiator: PairedParty, receiver: PairedParty) -> BrokerResult {
        let pairing = Pairing::new(initiator.clone(), receiver.clone());
        let id = pairing.id;
        self.pairings.insert(pairing)?;

        let cross_instance = initiator.instance != receiver.instance;
        for (party, role, partner) in [
            (&initiator, Role::Initiator, &receiver),
            (&receiver, Role::Receiver, &initiator),
        ] {
            if party.instance != *self.instance() {
                continue;
            }
            let matched = Trigger::Matched {
                role,
                partner_address: partner.identity.peer_address.clone(),
            };
            if let Err(e) = self.deliver(party.handle(), matched) {
                self.pairings.remove_by_member(party.handle());
                return Err(e);
            }
        }

        metrics::record_pairing(cross_instance);
        info!(
            pairing = %id,
            initiator = %initiator.handle(),
            receiver = %receiver.handle(),
            cross_instance,
            "Pairing established"
        );
        Ok(())
    }

    async fn vacate(&mut self, handle: ConnectionHandle) {
        match self.matchmaker.cancel(handle).await {
            Ok(true) => debug!(handle = %handle, "Left the waiting slot"),
            // A claim won the race; its notice will find the session gone.
            Ok(false) => debug!(handle = %handle, "Waiting entry was already claimed"),
            Err(e) => error!(handle = %handle, error = %e, "Failed to vacate waiting entry"),
        }
    }

    async fn tear_down(&mut self, handle: ConnectionHandle, departure: Departure) {
        let Some(pairing) = self.pairings.remove_by_member(handle) else {
            warn!(handle = %handle, "No pairing to tear down");
            return;
        };
        let Some(partner) = pairing.partner_of(handle).cloned() else {
            return;
        };

        metrics::record_session_ended(departure.as_str());
        info!(
            pairing = %pairing.id,
            handle = %handle,
            partner = %partner.handle(),
            reason = departure.as_str(),
            duration_secs = (chrono::Utc::now() - pairing.established_at).num_seconds(),
            "Pairing dissolved"
        );

        if partner.instance == *self.instance() {
            if let Err(e) = self.deliver(partner.handle(), Trigger::PartnerLeft(departure)) {
                debug!(handle = %partner.handle(), error = %e, "Partner already gone");
            }
        } else {
            let notice = RemoteNotice::PartnerLeft {
                recipient: partner.handle(),
                partner: handle,
                departure,
            };
            self.send_remote(&partner.instance, notice).await;
        }
    }

    fn on_partner_left(
        &mut self,
        recipient: ConnectionHandle,
        partner: ConnectionHandle,
        departure: Departure,
    ) {
        let current = self
            .pairings
            .get_by_member(recipient)
            .and_then(|p| p.partner_of(recipient))
            .map(PairedParty::handle);
        if current != Some(partner) {
            debug!(handle = %recipient, partner = %partner, "Ignoring departure for a pairing that no longer exists");
            return;
        }

        self.pairings.remove_by_member(recipient);
        metrics::record_session_ended(departure.as_str());
        if let Err(e) = self.deliver(recipient, Trigger::PartnerLeft(departure)) {
            debug!(handle = %recipient, error = %e, "Recipient already gone");
        }
    }

    async fn send_remote(&self, to: &InstanceId, notice: RemoteNotice) {
        if let Err(e) = self.relay.publish(to, &notice).await {
            error!(instance = %to, notice = notice.name(), error = %e, "Failed to publish notice");
        }
    }

    fn refresh_gauges(&self) {
        let snapshot = self.snapshot();
        metrics::set_broker_gauges(snapshot.sessions, snapshot.waiting, snapshot.pairings);
    }
}

/// Frames that move the client's view of its session forward.
fn is_session_frame(msg: &ServerMessage) -> bool {
    !matches!(
        msg,
        ServerMessage::Error { .. } | ServerMessage::Ping { .. } | ServerMessage::Pong { .. }
    )
}
