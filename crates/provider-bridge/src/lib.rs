//! Link Provider backed by an external linking sidecar.
//!
//! The sidecar performs the device-linking handshake. This crate speaks the
//! envelope protocol to it over WebSocket: requests are correlated by id,
//! and pushes are translated into provider events.

pub mod client;
pub mod error;
pub mod provider;
mod pumps;

pub use client::BridgeClient;
pub use error::BridgeError;
pub use provider::{BridgeConfig, BridgeProvider, BridgeProviderFactory};
