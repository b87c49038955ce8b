//! Connection - Handles an individual client connection.
//!
//! Each Connection runs in its own Tokio task:
//!
//! ```text
//!   Transport ──frames──▶ tokio::select! ──requests──▶ BrokerHandle
//!       ▲                      │  ▲                        │
//!       │                      │  └──── outbox (mpsc) ◀────┘
//!       └──── writes ──────────┘
//!                              └── keepalive ticker
//! ```
//!
//! The broker never writes to the socket itself. Everything it has to say
//! to this client arrives through the outbox, in the order the broker
//! produced it. A closed outbox ends the connection.

use crate::config::Config;
use crate::error::BrokerError;
use crate::metrics;
use crate::network::limit::RateLimitManager;
use crate::state::{BrokerHandle, ConnectionHandle};
use crate::telemetry::{EventTimer, spans};
use rendezvous_proto::{ClientMessage, ServerMessage, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, info, warn};

/// Consecutive rate-limited frames tolerated before disconnecting.
const MAX_FLOOD_VIOLATIONS: u8 = 3;

/// Upper bound on how often the keepalive state is examined.
const PING_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Per-connection settings derived from the broker configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub server_name: String,
    /// Idle time before the broker pings the client.
    pub ping_interval: Duration,
    /// Time the client has to answer a ping.
    pub ping_timeout: Duration,
    pub max_frame_len: usize,
    pub outbox_capacity: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_name: config.server.name.clone(),
            ping_interval: Duration::from_secs(config.idle_timeouts.ping),
            ping_timeout: Duration::from_secs(config.idle_timeouts.timeout),
            max_frame_len: config.limits.max_frame_len,
            outbox_capacity: config.limits.outbox_capacity,
        }
    }

    fn check_interval(&self) -> Duration {
        self.ping_interval
            .min(self.ping_timeout)
            .min(PING_CHECK_INTERVAL)
            .max(Duration::from_millis(100))
    }
}

/// What the keepalive ticker wants done.
#[derive(Debug, PartialEq, Eq)]
enum KeepaliveAction {
    Nothing,
    SendPing,
    TimedOut { idle: Duration },
}

/// Idle tracking for one connection.
#[derive(Debug)]
struct Keepalive {
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
}

impl Keepalive {
    fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            ping_sent_at: None,
        }
    }

    /// Any frame from the client counts as an answer.
    fn on_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.ping_sent_at = None;
    }

    fn check(&mut self, now: Instant, interval: Duration, timeout: Duration) -> KeepaliveAction {
        match self.ping_sent_at {
            Some(sent_at) if now.duration_since(sent_at) >= timeout => KeepaliveAction::TimedOut {
                idle: now.duration_since(self.last_activity),
            },
            Some(_) => KeepaliveAction::Nothing,
            None if now.duration_since(self.last_activity) >= interval => {
                self.ping_sent_at = Some(now);
                KeepaliveAction::SendPing
            }
            None => KeepaliveAction::Nothing,
        }
    }
}

/// Result of handling one client frame.
enum Flow {
    Continue,
    Reply(ServerMessage),
    Close,
}

/// A client connection handler.
pub struct Connection {
    handle: ConnectionHandle,
    addr: SocketAddr,
    transport: Transport,
    broker: BrokerHandle,
    settings: Arc<ConnectionSettings>,
    rate_limiter: Arc<RateLimitManager>,
}

impl Connection {
    /// Create a new connection handler.
    pub fn new(
        handle: ConnectionHandle,
        addr: SocketAddr,
        transport: Transport,
        broker: BrokerHandle,
        settings: Arc<ConnectionSettings>,
        rate_limiter: Arc<RateLimitManager>,
    ) -> Self {
        Self {
            handle,
            addr,
            transport,
            broker,
            settings,
            rate_limiter,
        }
    }

    /// Serve the client until it leaves, then release its session.
    pub async fn run(self) {
        let span = spans::connection(
            &self.handle.to_string(),
            &self.addr.to_string(),
            self.transport.kind(),
        );
        self.serve().instrument(span).await
    }

    async fn serve(mut self) {
        info!(server = %self.settings.server_name, "Client connected");

        let (outbox_tx, mut outbox_rx) = mpsc::channel(self.settings.outbox_capacity);
        if let Err(e) = self.broker.attach(self.handle, outbox_tx).await {
            warn!(error = %e, "Broker unavailable - dropping client");
            self.transport.close().await;
            return;
        }

        let welcome = ServerMessage::Welcome {
            handle: self.handle.to_string(),
            server: self.settings.server_name.clone(),
        };
        if let Err(e) = self.transport.send(welcome).await {
            debug!(error = %e, "Write error before first frame");
        } else {
            self.event_loop(&mut outbox_rx).await;
        }

        self.broker.disconnect(self.handle).await;
        self.rate_limiter.remove_client(self.handle);
        self.transport.close().await;
        info!("Client disconnected");
    }

    async fn event_loop(&mut self, outbox_rx: &mut mpsc::Receiver<ServerMessage>) {
        let mut keepalive = Keepalive::new(Instant::now());
        let mut ticker = tokio::time::interval(self.settings.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flood_violations: u8 = 0;

        loop {
            tokio::select! {
                frame = self.transport.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) if e.is_recoverable() => {
                            debug!(error = %e, "Malformed frame");
                            keepalive.on_activity(Instant::now());
                            let reply = ServerMessage::error("malformed_frame", e.to_string());
                            if self.write(reply).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Read error");
                            break;
                        }
                        None => break,
                    };
                    keepalive.on_activity(Instant::now());

                    if !self.rate_limiter.check_message_rate(self.handle) {
                        flood_violations += 1;
                        metrics::record_rate_limited("message");
                        warn!(violations = flood_violations, "Rate limit exceeded");

                        if flood_violations >= MAX_FLOOD_VIOLATIONS {
                            warn!("Maximum flood violations reached - disconnecting");
                            let _ = self.write(ServerMessage::error("flood", "Excess flood")).await;
                            break;
                        }
                        let notice = ServerMessage::error(
                            "rate_limited",
                            format!("Frame dropped ({flood_violations}/{MAX_FLOOD_VIOLATIONS} before disconnect)"),
                        );
                        if self.write(notice).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    flood_violations = 0;

                    match self.dispatch(msg).await {
                        Flow::Continue => {}
                        Flow::Reply(reply) => {
                            if self.write(reply).await.is_err() {
                                break;
                            }
                        }
                        Flow::Close => break,
                    }
                }

                msg = outbox_rx.recv() => {
                    let Some(msg) = msg else {
                        warn!("Broker closed the outbox - disconnecting");
                        break;
                    };
                    if self.write(msg).await.is_err() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let action = keepalive.check(
                        Instant::now(),
                        self.settings.ping_interval,
                        self.settings.ping_timeout,
                    );
                    match action {
                        KeepaliveAction::Nothing => {}
                        KeepaliveAction::SendPing => {
                            if self.write(ServerMessage::Ping { token: None }).await.is_err() {
                                break;
                            }
                        }
                        KeepaliveAction::TimedOut { idle } => {
                            info!(idle_secs = idle.as_secs(), "Ping timeout - disconnecting");
                            let _ = self
                                .write(ServerMessage::error("ping_timeout", "No answer to ping"))
                                .await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn write(&mut self, msg: ServerMessage) -> Result<(), ()> {
        self.transport.send(msg).await.map_err(|e| {
            debug!(error = %e, "Write error");
        })
    }

    /// Hand a request to the broker.
    ///
    /// Broker replies, including the error frames a client should see, come
    /// back through the outbox. Only keepalive is answered here.
    async fn dispatch(&self, msg: ClientMessage) -> Flow {
        let event = msg.name();
        let _timer = EventTimer::new(event);

        let result = match msg {
            ClientMessage::FindPartner { peer_address } => {
                self.broker.find_partner(self.handle, peer_address).await
            }
            ClientMessage::CancelSearch => self.broker.cancel_search(self.handle).await,
            ClientMessage::EndSession => self.broker.end_session(self.handle).await,
            ClientMessage::PeerState { state } => self.broker.peer_state(self.handle, state).await,
            ClientMessage::Ping { token } => return Flow::Reply(ServerMessage::Pong { token }),
            ClientMessage::Pong { .. } => return Flow::Continue,
        };

        match result {
            Ok(()) => Flow::Continue,
            Err(BrokerError::BrokerGone) => {
                warn!(event, "Broker stopped - closing connection");
                Flow::Close
            }
            Err(e) if e.is_transient() => {
                warn!(event, error = %e, "Request failed, client may retry");
                Flow::Continue
            }
            Err(e) => {
                debug!(event, error = %e, "Request rejected");
                Flow::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(90);
    const TIMEOUT: Duration = Duration::from_secs(120);

    #[test]
    fn test_keepalive_pings_once_after_idle_interval() {
        let start = Instant::now();
        let mut keepalive = Keepalive::new(start);

        assert_eq!(keepalive.check(start + Duration::from_secs(30), INTERVAL, TIMEOUT), KeepaliveAction::Nothing);
        assert_eq!(keepalive.check(start + INTERVAL, INTERVAL, TIMEOUT), KeepaliveAction::SendPing);
        // Waiting for the answer
        assert_eq!(
            keepalive.check(start + INTERVAL + Duration::from_secs(60), INTERVAL, TIMEOUT),
            KeepaliveAction::Nothing
        );
    }

    #[test]
    fn test_keepalive_times_out_without_answer() {
        let start = Instant::now();
        let mut keepalive = Keepalive::new(start);
        keepalive.check(start + INTERVAL, INTERVAL, TIMEOUT);

        let action = keepalive.check(start + INTERVAL + TIMEOUT, INTERVAL, TIMEOUT);
        assert_eq!(action, KeepaliveAction::TimedOut { idle: INTERVAL + TIMEOUT });
    }

    #[test]
    fn test_activity_clears_pending_ping() {
        let start = Instant::now();
        let mut keepalive = Keepalive::new(start);
        keepalive.check(start + INTERVAL, INTERVAL, TIMEOUT);

        let answered = start + INTERVAL + Duration::from_secs(1);
        keepalive.on_activity(answered);
        assert_eq!(keepalive.check(answered + TIMEOUT / 2, INTERVAL, TIMEOUT), KeepaliveAction::Nothing);
        assert_eq!(keepalive.check(answered + INTERVAL, INTERVAL, TIMEOUT), KeepaliveAction::SendPing);
    }

    #[test]
    fn test_check_interval_is_bounded() {
        let settings = |ping, timeout| ConnectionSettings {
            server_name: "rendezvous.test".into(),
            ping_interval: Duration::from_secs(ping),
            ping_timeout: Duration::from_secs(timeout),
            max_frame_len: 4096,
            outbox_capacity: 64,
        };
        assert_eq!(settings(90, 120).check_interval(), PING_CHECK_INTERVAL);
        assert_eq!(settings(2, 1).check_interval(), Duration::from_secs(1));
    }
}
