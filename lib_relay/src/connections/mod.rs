//! # Connections Module
//!
//! Outbound connections to the provider endpoints.

/// WebSocket provider connections over tokio-tungstenite.
pub mod ws_provider;
