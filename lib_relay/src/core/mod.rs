//! # Core Relay Engine
//!
//! This module aggregates every component the relay needs to move events from
//! the single ingress producer to the provider connections.
//!
//! ## Core Components:
//!
//! - **`event`**: The `Event` record and the `Frame` unit that crosses every
//!   websocket boundary.
//!
//! - **`rate_limiter`**: A token bucket that is fully reset on every tick. All
//!   provider workers share one instance.
//!
//! - **`event_buffer`**: The append-only log of decoded events, plus the live
//!   feed of raw ingress frames that pass-through workers subscribe to.
//!
//! - **`ingress_gateway`**: Reads the producer connection, decodes frames and
//!   appends them to the buffer.
//!
//! - **`failover`**: The single-fire signal that releases the backup provider.
//!
//! - **`provider_worker`**: The per-provider state machine
//!   (`Draining -> AwaitingPermit -> PassThrough -> Terminated`).
//!
//! - **`supervisor`**: Owns every spawned task and records how it ended.
//!
//! - **`controller`**: The aggregate root that wires all of the above and is
//!   passed by handle to every task.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// The relayed record and the websocket frame unit.
pub mod event;
/// Token bucket shared by every sender.
pub mod rate_limiter;
/// Append-only event log and live feed of raw ingress frames.
pub mod event_buffer;
/// Reader for the producer-facing connection.
pub mod ingress_gateway;
/// Single-fire primary to backup handover signal.
pub mod failover;
/// Drain / pass-through state machine for one provider connection.
pub mod provider_worker;
/// Root task owner with per-task terminal state.
pub mod supervisor;
/// Aggregate root and startup wiring.
pub mod controller;
/// Engine settings independent of the CLI surface.
pub mod settings;

// --- Public API Re-exports ---
pub use controller::{Controller, IngressHandle, ProviderConnector, ProviderHandle};
pub use event::{BoxFrameSink, BoxFrameStream, Event, Frame};
pub use event_buffer::{EventBuffer, LiveFeed, LiveFrame};
pub use failover::FailoverSignal;
pub use ingress_gateway::IngressGateway;
pub use provider_worker::{ProviderRole, ProviderWorker, StartPhase, WorkerState};
pub use rate_limiter::RateLimiter;
pub use settings::{BackoffPolicy, DrainGapPolicy, RelaySettings};
pub use supervisor::{Supervisor, TaskState};
