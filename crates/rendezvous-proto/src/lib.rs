//! # rendezvous-proto
//!
//! Wire protocol for the rendezvous matchmaking broker.
//!
//! ## Features
//!
//! - Typed client and broker frames ([`ClientMessage`], [`ServerMessage`])
//! - Newline-delimited JSON codec for tokio ([`JsonCodec`])
//! - Broker-side transport over TCP, TLS and WebSocket ([`Transport`])
//!
//! ## Quick Start
//!
//! ```rust
//! use rendezvous_proto::{ClientMessage, ServerMessage, Role};
//!
//! let request = ClientMessage::find_partner("peer-7f3a");
//! let line = serde_json::to_string(&request).unwrap();
//! assert_eq!(line, r#"{"type":"find_partner","peer_address":"peer-7f3a"}"#);
//!
//! let reply: ServerMessage = serde_json::from_str(
//!     r#"{"type":"paired","role":"initiator","partner_address":"peer-19c2"}"#,
//! ).unwrap();
//! assert_eq!(reply, ServerMessage::paired(Role::Initiator, "peer-19c2"));
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

#[cfg(feature = "tokio")]
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod line;
pub mod message;
#[cfg(feature = "tokio")]
pub mod transport;

#[cfg(feature = "tokio")]
pub use self::codec::{parse_frame, ClientCodec, JsonCodec, ServerCodec};
pub use self::error::{ProtocolError, TransportReadError};
#[cfg(feature = "tokio")]
pub use self::line::{LineCodec, DEFAULT_MAX_LINE_LEN};
pub use self::message::{ClientMessage, PeerConnectionState, Role, ServerMessage};
#[cfg(feature = "tokio")]
pub use self::transport::Transport;
