//! The broker actor.
//!
//! A single task owns the [`Lifecycle`] and applies events one at a time,
//! which gives every client event mutual exclusion over the waiting slot and
//! the pairing book without any locks on the hot path. Connections and
//! store pollers talk to it through a cloneable [`BrokerHandle`].

use rendezvous_proto::{PeerConnectionState, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::metrics;
use crate::state::{BrokerSnapshot, ConnectionHandle, Lifecycle, RemoteNotice};

/// Depth of the broker's event queue.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Events that can be sent to the broker actor.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A client connected; frames for it go to `outbox`.
    Attach {
        handle: ConnectionHandle,
        outbox: mpsc::Sender<ServerMessage>,
    },
    FindPartner {
        handle: ConnectionHandle,
        peer_address: String,
        reply_tx: oneshot::Sender<BrokerResult>,
    },
    CancelSearch {
        handle: ConnectionHandle,
        reply_tx: oneshot::Sender<BrokerResult>,
    },
    EndSession {
        handle: ConnectionHandle,
        reply_tx: oneshot::Sender<BrokerResult>,
    },
    PeerState {
        handle: ConnectionHandle,
        state: PeerConnectionState,
        reply_tx: oneshot::Sender<BrokerResult>,
    },
    /// The client's connection is gone.
    Disconnect {
        handle: ConnectionHandle,
        reply_tx: Option<oneshot::Sender<()>>,
    },
    /// Something happened on another broker instance.
    Remote(RemoteNotice),
    Snapshot {
        reply_tx: oneshot::Sender<BrokerSnapshot>,
    },
    /// Release every session and stop.
    Shutdown { reply_tx: oneshot::Sender<()> },
}

impl BrokerEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::FindPartner { .. } => "find_partner",
            Self::CancelSearch { .. } => "cancel_search",
            Self::EndSession { .. } => "end_session",
            Self::PeerState { .. } => "peer_state",
            Self::Disconnect { .. } => "disconnect",
            Self::Remote(_) => "remote",
            Self::Snapshot { .. } => "snapshot",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

pub struct Broker {
    lifecycle: Lifecycle,
}

impl Broker {
    /// Spawn the broker task and return a handle to it.
    pub fn spawn(lifecycle: Lifecycle) -> BrokerHandle {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        info!(instance = %lifecycle.instance(), "Broker started");

        let broker = Self { lifecycle };
        tokio::spawn(async move {
            broker.run(rx).await;
        });

        BrokerHandle { tx }
    }

    /// The main actor loop.
    async fn run(mut self, mut rx: mpsc::Receiver<BrokerEvent>) {
        while let Some(event) = rx.recv().await {
            if let BrokerEvent::Shutdown { reply_tx } = event {
                self.lifecycle.shutdown().await;
                let _ = reply_tx.send(());
                break;
            }
            self.handle_event(event).await;
        }
        info!(instance = %self.lifecycle.instance(), "Broker stopped");
    }

    async fn handle_event(&mut self, event: BrokerEvent) {
        let name = event.name();
        match event {
            BrokerEvent::Attach { handle, outbox } => self.lifecycle.attach(handle, outbox),
            BrokerEvent::FindPartner {
                handle,
                peer_address,
                reply_tx,
            } => {
                let result = self.lifecycle.find_partner(handle, peer_address).await;
                self.finish(name, handle, result, reply_tx);
            }
            BrokerEvent::CancelSearch { handle, reply_tx } => {
                let result = self.lifecycle.cancel_search(handle).await;
                self.finish(name, handle, result, reply_tx);
            }
            BrokerEvent::EndSession { handle, reply_tx } => {
                let result = self.lifecycle.end_session(handle).await;
                self.finish(name, handle, result, reply_tx);
            }
            BrokerEvent::PeerState {
                handle,
                state,
                reply_tx,
            } => {
                let result = self.lifecycle.peer_state(handle, state).await;
                self.finish(name, handle, result, reply_tx);
            }
            BrokerEvent::Disconnect { handle, reply_tx } => {
                self.lifecycle.on_disconnect(handle).await;
                if let Some(tx) = reply_tx {
                    let _ = tx.send(());
                }
            }
            BrokerEvent::Remote(notice) => self.lifecycle.on_remote(notice).await,
            BrokerEvent::Snapshot { reply_tx } => {
                let _ = reply_tx.send(self.lifecycle.snapshot());
            }
            BrokerEvent::Shutdown { reply_tx } => {
                let _ = reply_tx.send(());
            }
        }
    }

    /// Report the outcome of a client request.
    ///
    /// User-visible errors are queued on the client's outbox behind any
    /// frames the request already produced, so ordering is preserved.
    fn finish(
        &mut self,
        event: &'static str,
        handle: ConnectionHandle,
        result: BrokerResult,
        reply_tx: oneshot::Sender<BrokerResult>,
    ) {
        if let Err(e) = &result {
            metrics::record_event_error(event, e.error_code());
            match e.to_reply() {
                Some(reply) => {
                    warn!(handle = %handle, event, error = %e, "Request failed");
                    self.lifecycle.reply(handle, reply);
                }
                None => debug!(handle = %handle, event, error = %e, "Request rejected"),
            }
        }
        let _ = reply_tx.send(result);
    }
}

/// Cloneable handle to the broker actor.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerEvent>,
}

impl BrokerHandle {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<BrokerResult>) -> BrokerEvent,
    ) -> BrokerResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| BrokerError::BrokerGone)?;
        reply_rx.await.map_err(|_| BrokerError::BrokerGone)?
    }

    pub async fn attach(
        &self,
        handle: ConnectionHandle,
        outbox: mpsc::Sender<ServerMessage>,
    ) -> BrokerResult {
        self.tx
            .send(BrokerEvent::Attach { handle, outbox })
            .await
            .map_err(|_| BrokerError::BrokerGone)
    }

    pub async fn find_partner(&self, handle: ConnectionHandle, peer_address: String) -> BrokerResult {
        self.request(|reply_tx| BrokerEvent::FindPartner {
            handle,
            peer_address,
            reply_tx,
        })
        .await
    }

    pub async fn cancel_search(&self, handle: ConnectionHandle) -> BrokerResult {
        self.request(|reply_tx| BrokerEvent::CancelSearch { handle, reply_tx })
            .await
    }

    pub async fn end_session(&self, handle: ConnectionHandle) -> BrokerResult {
        self.request(|reply_tx| BrokerEvent::EndSession { handle, reply_tx })
            .await
    }

    pub async fn peer_state(
        &self,
        handle: ConnectionHandle,
        state: PeerConnectionState,
    ) -> BrokerResult {
        self.request(|reply_tx| BrokerEvent::PeerState {
            handle,
            state,
            reply_tx,
        })
        .await
    }

    /// Report a closed connection and wait until its session is released.
    pub async fn disconnect(&self, handle: ConnectionHandle) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = BrokerEvent::Disconnect {
            handle,
            reply_tx: Some(reply_tx),
        };
        if self.tx.send(event).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Forward a notice from the shared store.
    pub async fn remote(&self, notice: RemoteNotice) -> BrokerResult {
        self.tx
            .send(BrokerEvent::Remote(notice))
            .await
            .map_err(|_| BrokerError::BrokerGone)
    }

    pub async fn snapshot(&self) -> Result<BrokerSnapshot, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BrokerEvent::Snapshot { reply_tx })
            .await
            .map_err(|_| BrokerError::BrokerGone)?;
        reply_rx.await.map_err(|_| BrokerError::BrokerGone)
    }

    /// Release every session and stop the actor.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(BrokerEvent::Shutdown { reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InstanceId, LocalRelay, Matchmaker, MemorySlot};
    use rendezvous_proto::Role;
    use std::sync::Arc;

    fn spawn_broker() -> BrokerHandle {
        let matchmaker = Matchmaker::new(Arc::new(MemorySlot::new()), InstanceId::new("test"), 1);
        Broker::spawn(Lifecycle::new(matchmaker, Arc::new(LocalRelay)))
    }

    async fn attach(broker: &BrokerHandle) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        let handle = ConnectionHandle::generate();
        let (tx, rx) = mpsc::channel(16);
        broker.attach(handle, tx).await.unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_pairing_through_handle() {
        let broker = spawn_broker();
        let (a, mut a_rx) = attach(&broker).await;
        let (b, mut b_rx) = attach(&broker).await;

        broker.find_partner(a, "addr-a".into()).await.unwrap();
        broker.find_partner(b, "addr-b".into()).await.unwrap();

        assert_eq!(a_rx.recv().await.unwrap(), ServerMessage::Waiting);
        assert_eq!(
            a_rx.recv().await.unwrap(),
            ServerMessage::paired(Role::Receiver, "addr-b")
        );
        assert_eq!(
            b_rx.recv().await.unwrap(),
            ServerMessage::paired(Role::Initiator, "addr-a")
        );
        assert_eq!(broker.snapshot().await.unwrap().pairings, 1);
    }

    #[tokio::test]
    async fn test_visible_errors_are_queued_on_outbox() {
        let broker = spawn_broker();
        let (a, mut a_rx) = attach(&broker).await;

        let err = broker.find_partner(a, "bad\u{0}addr".into()).await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_peer_address");
        match a_rx.recv().await.unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, "invalid_peer_address"),
            other => panic!("unexpected frame: {other:?}"),
        }

        // Silent rejections produce no frame.
        assert!(broker.cancel_search(a).await.is_err());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_release() {
        let broker = spawn_broker();
        let (a, _a_rx) = attach(&broker).await;
        broker.find_partner(a, "addr-a".into()).await.unwrap();

        broker.disconnect(a).await;
        let snapshot = broker.snapshot().await.unwrap();
        assert_eq!(snapshot.sessions, 0);
        assert_eq!(snapshot.waiting, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let broker = spawn_broker();
        let (a, _a_rx) = attach(&broker).await;
        broker.find_partner(a, "addr-a".into()).await.unwrap();

        broker.shutdown().await;
        assert!(matches!(
            broker.find_partner(a, "addr-a".into()).await,
            Err(BrokerError::BrokerGone)
        ));
    }
}
