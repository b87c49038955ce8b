//! Network module.
//!
//! Contains the Gateway (TCP/TLS/WebSocket listeners), the per-client
//! Connection handler, and rate limiting.

mod connection;
mod gateway;
pub mod limit;

pub use connection::{Connection, ConnectionSettings};
pub use gateway::Gateway;
