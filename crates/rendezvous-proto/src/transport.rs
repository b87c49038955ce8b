//! Broker-side transport over TCP, TLS and WebSocket.
//!
//! TCP and TLS connections carry newline-delimited JSON through
//! [`ServerCodec`]; WebSocket connections carry one JSON object per text
//! frame. All three present the same `next` / `send` surface.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Framed;
use tracing::warn;

use crate::codec::{parse_frame, ServerCodec};
use crate::error::{ProtocolError, TransportReadError};
use crate::message::{ClientMessage, ServerMessage};

/// Broker-side transport over the supported stream types.
#[allow(clippy::large_enum_variant)]
#[non_exhaustive]
pub enum Transport {
    /// Plain TCP transport.
    Tcp {
        /// The framed codec for TCP.
        framed: Framed<TcpStream, ServerCodec>,
    },
    /// TLS-encrypted TCP transport.
    Tls {
        /// The framed codec for TLS.
        framed: Framed<TlsStream<TcpStream>, ServerCodec>,
    },
    /// WebSocket transport (plain).
    WebSocket {
        /// The WebSocket stream.
        stream: WebSocketStream<TcpStream>,
        /// Maximum accepted text frame length in bytes.
        max_len: usize,
    },
}

impl Transport {
    /// Create a new TCP transport from a connected stream.
    pub fn tcp(stream: TcpStream, max_len: usize) -> Self {
        if let Err(e) = Self::enable_keepalive(&stream) {
            warn!("failed to enable TCP keepalive: {}", e);
        }

        Self::Tcp {
            framed: Framed::new(stream, ServerCodec::with_max_len(max_len)),
        }
    }

    fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
        use socket2::{SockRef, TcpKeepalive};
        use std::time::Duration;

        let sock = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(120))
            .with_interval(Duration::from_secs(30));

        sock.set_tcp_keepalive(&keepalive)
    }

    /// Create a new transport from an established server-side TLS stream.
    pub fn tls(stream: TlsStream<TcpStream>, max_len: usize) -> Self {
        Self::Tls {
            framed: Framed::new(stream, ServerCodec::with_max_len(max_len)),
        }
    }

    /// Create a new transport from an accepted WebSocket stream.
    pub fn websocket(stream: WebSocketStream<TcpStream>, max_len: usize) -> Self {
        Self::WebSocket { stream, max_len }
    }

    /// Short transport name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Tls { .. } => "tls",
            Self::WebSocket { .. } => "websocket",
        }
    }

    /// Read the next client frame.
    ///
    /// Returns `None` once the peer has closed the stream. Errors for which
    /// [`TransportReadError::is_recoverable`] holds leave the transport usable.
    pub async fn next(&mut self) -> Option<Result<ClientMessage, TransportReadError>> {
        match self {
            Self::Tcp { framed } => Self::next_framed(framed.next().await),
            Self::Tls { framed } => Self::next_framed(framed.next().await),
            Self::WebSocket { stream, max_len } => loop {
                let text = match stream.next().await? {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            return Some(Err(ProtocolError::InvalidUtf8 {
                                byte_pos: e.utf8_error().valid_up_to(),
                                details: e.utf8_error().to_string(),
                            }
                            .into()));
                        }
                    },
                    Ok(WsMessage::Close(_)) => return None,
                    // Ping/Pong are answered by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => return Some(Err(ProtocolError::from(e).into())),
                };

                if text.len() > *max_len {
                    return Some(Err(ProtocolError::MessageTooLong {
                        actual: text.len(),
                        limit: *max_len,
                    }
                    .into()));
                }
                if text.trim().is_empty() {
                    continue;
                }
                return Some(parse_frame(&text).map_err(Into::into));
            },
        }
    }

    fn next_framed(
        item: Option<Result<Result<ClientMessage, ProtocolError>, ProtocolError>>,
    ) -> Option<Result<ClientMessage, TransportReadError>> {
        match item? {
            Ok(Ok(msg)) => Some(Ok(msg)),
            Ok(Err(e)) | Err(e) => Some(Err(match e {
                ProtocolError::Io(io) => TransportReadError::Io(io),
                other => TransportReadError::Protocol(other),
            })),
        }
    }

    /// Write a frame to the client.
    pub async fn send(&mut self, msg: ServerMessage) -> Result<(), ProtocolError> {
        match self {
            Self::Tcp { framed } => framed.send(msg).await,
            Self::Tls { framed } => framed.send(msg).await,
            Self::WebSocket { stream, .. } => {
                let text = serde_json::to_string(&msg)?;
                stream.send(WsMessage::Text(text)).await?;
                Ok(())
            }
        }
    }

    /// Flush and close the write side.
    pub async fn close(&mut self) {
        let _ = match self {
            Self::Tcp { framed } => framed.close().await,
            Self::Tls { framed } => framed.close().await,
            Self::WebSocket { stream, .. } => stream.close(None).await.map_err(ProtocolError::from),
        };
    }
}
