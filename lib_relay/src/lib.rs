//! # lib_relay
//!
//! The relay engine behind the `relay_controller` server: one producer ("app")
//! streams events in, the engine buffers them, drains them under a token bucket
//! to a primary provider, and hands over to a backup provider exactly once the
//! primary has caught up.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

// Declare the modules to re-export
pub mod connections;
pub mod core;
pub mod error;

// Re-export everything a server binary needs to wire the engine.
pub use crate::core::*;
pub use connections::ws_provider::WsProviderConnector;
pub use error::RelayError;
