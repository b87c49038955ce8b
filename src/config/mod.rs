//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Core config struct definitions (Config, ServerConfig, IdleTimeoutsConfig)
//! - [`listen`]: Network listener configuration (ListenConfig, TlsConfig, WebSocketConfig)
//! - [`store`]: Waiting slot backend configuration (StoreConfig, StoreBackend)
//! - [`limits`]: Frame size, flood and buffering limits (LimitsConfig)
//! - [`validation`]: Startup checks

mod limits;
mod listen;
mod store;
mod types;
pub mod validation;

pub use limits::LimitsConfig;
pub use listen::{TlsConfig, WebSocketConfig};
pub use store::StoreBackend;
pub use types::Config;
pub use validation::validate;
