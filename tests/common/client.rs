//! Test broker client.
//!
//! Speaks the newline-delimited JSON protocol through the same codec real
//! clients use, with timeouts on every read.

use futures_util::{SinkExt, StreamExt};
use rendezvous_proto::{ClientCodec, ClientMessage, PeerConnectionState, ServerMessage};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

/// A test client.
pub struct TestClient {
    framed: Framed<TcpStream, ClientCodec>,
    /// Handle announced in the `welcome` frame.
    pub handle: String,
    /// Server name announced in the `welcome` frame.
    pub server: String,
}

impl TestClient {
    /// Connect and consume the `welcome` frame.
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address).await?;
        let mut framed = Framed::new(stream, ClientCodec::new());

        let first = timeout(Duration::from_secs(5), framed.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed before welcome"))???;
        match first {
            ServerMessage::Welcome { handle, server } => Ok(Self {
                framed,
                handle,
                server,
            }),
            other => anyhow::bail!("expected welcome, got {other:?}"),
        }
    }

    /// Send a frame.
    pub async fn send(&mut self, msg: ClientMessage) -> anyhow::Result<()> {
        self.framed.send(msg).await?;
        Ok(())
    }

    /// Write raw bytes, bypassing the codec.
    #[allow(dead_code)]
    pub async fn send_raw(&mut self, line: &str) -> anyhow::Result<()> {
        let stream = self.framed.get_mut();
        stream.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            stream.write_all(b"\n").await?;
        }
        stream.flush().await?;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn find_partner(&mut self, peer_address: &str) -> anyhow::Result<()> {
        self.send(ClientMessage::find_partner(peer_address)).await
    }

    #[allow(dead_code)]
    pub async fn peer_state(&mut self, state: PeerConnectionState) -> anyhow::Result<()> {
        self.send(ClientMessage::PeerState { state }).await
    }

    /// Receive a single frame.
    pub async fn recv(&mut self) -> anyhow::Result<ServerMessage> {
        self.recv_timeout(Duration::from_secs(5)).await
    }

    /// Receive a frame with a timeout.
    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<ServerMessage> {
        match timeout(dur, self.framed.next()).await? {
            Some(frame) => Ok(frame??),
            None => anyhow::bail!("connection closed"),
        }
    }

    /// Receive frames, skipping broker pings, until `predicate` matches.
    #[allow(dead_code)]
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> anyhow::Result<ServerMessage>
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            let msg = self.recv().await?;
            if predicate(&msg) {
                return Ok(msg);
            }
        }
    }

    /// Assert that nothing arrives for `dur`.
    #[allow(dead_code)]
    pub async fn expect_silence(&mut self, dur: Duration) -> anyhow::Result<()> {
        match timeout(dur, self.framed.next()).await {
            Err(_) => Ok(()),
            Ok(frame) => anyhow::bail!("expected silence, got {frame:?}"),
        }
    }

    /// Whether the broker has closed the connection.
    #[allow(dead_code)]
    pub async fn is_closed(&mut self, dur: Duration) -> bool {
        loop {
            match timeout(dur, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}
