//! # Provider Worker
//!
//! Drives one provider connection through its lifecycle:
//!
//! ```text
//!   Draining <-> AwaitingPermit          (while backlog remains)
//!      |
//!      v  caught up (fires failover if this worker is the trigger)
//!   PassThrough                          (live ingress frames, unrated)
//!      |
//!      v  any read/write error
//!   Terminated                           (absorbing)
//! ```
//!
//! While draining, the worker reads the shared [`EventBuffer`] by its own
//! index, asks the shared [`RateLimiter`] for a permit before every send, and
//! re-serializes each event as a JSON text frame. Once its index equals the
//! buffer length at a check, it switches to forwarding live ingress frames
//! verbatim. A write error in any phase ends the worker; there is no retry.

use std::fmt;
use std::sync::Arc;

use futures_util::SinkExt;
use tokio::sync::watch;

use crate::core::event::{BoxFrameSink, Frame};
use crate::core::event_buffer::{EventBuffer, LiveFeed, LiveFrame};
use crate::core::failover::FailoverSignal;
use crate::core::rate_limiter::RateLimiter;
use crate::core::settings::{BackoffPolicy, DrainGapPolicy};
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderRole {
    Primary,
    Backup,
}

impl ProviderRole {
    /// Label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            ProviderRole::Primary => "Main",
            ProviderRole::Backup => "Backup",
        }
    }

    /// Name the worker is registered under in the supervisor.
    pub fn worker_task(&self) -> &'static str {
        match self {
            ProviderRole::Primary => "worker-main",
            ProviderRole::Backup => "worker-backup",
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Draining,
    AwaitingPermit,
    PassThrough,
    Terminated,
}

/// Where a worker begins. Backup workers skip the drain entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPhase {
    #[default]
    Drain,
    PassThrough,
}

pub struct ProviderWorker {
    role: ProviderRole,
    sink: BoxFrameSink,
    buffer: Arc<EventBuffer>,
    limiter: Arc<RateLimiter>,
    trigger: Option<Arc<FailoverSignal>>,
    backoff: BackoffPolicy,
    drain_gap: DrainGapPolicy,
    /// Live feed subscription taken up front by workers that skip the drain.
    live: Option<LiveFeed>,
    index: usize,
    state: watch::Sender<WorkerState>,
}

impl ProviderWorker {
    pub fn new(
        role: ProviderRole,
        sink: BoxFrameSink,
        buffer: Arc<EventBuffer>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Draining);
        Self {
            role,
            sink,
            buffer,
            limiter,
            trigger: None,
            backoff: BackoffPolicy::default(),
            drain_gap: DrainGapPolicy::default(),
            live: None,
            index: 0,
            state,
        }
    }

    /// Makes this worker fire `signal` once its drain is complete.
    pub fn with_trigger(mut self, signal: Arc<FailoverSignal>) -> Self {
        self.trigger = Some(signal);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_drain_gap(mut self, drain_gap: DrainGapPolicy) -> Self {
        self.drain_gap = drain_gap;
        self
    }

    /// A worker starting in pass-through subscribes to the live feed here, so
    /// frames ingested after construction are never missed.
    pub fn starting_in(mut self, start: StartPhase) -> Self {
        match start {
            StartPhase::Drain => {
                self.live = None;
                self.state.send_replace(WorkerState::Draining);
            }
            StartPhase::PassThrough => {
                self.live = Some(self.buffer.subscribe());
                self.state.send_replace(WorkerState::PassThrough);
            }
        }
        self
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    /// Follows the worker's state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Runs the worker until it terminates. The returned error is the I/O or
    /// signalling failure that ended it.
    pub async fn run(mut self) -> Result<(), RelayError> {
        log::info!("{} Worker started", self.role);
        let result = self.relay().await;
        self.set_state(WorkerState::Terminated);
        result
    }

    async fn relay(&mut self) -> Result<(), RelayError> {
        let live = match self.live.take() {
            Some(live) => live,
            None => self.drain().await?,
        };
        self.pass_through(live).await
    }

    /// Sends the backlog in index order and returns the live feed subscription
    /// pass-through continues from.
    async fn drain(&mut self) -> Result<LiveFeed, RelayError> {
        self.set_state(WorkerState::Draining);
        let drained_from = self.index;

        let caught_up = loop {
            // `None` means the index has caught up with the log.
            if let Some(event) = self.buffer.get(self.index) {
                self.await_permit().await;
                self.send(event.to_frame()?).await?;
                self.index += 1;
                continue;
            }

            match self.drain_gap {
                DrainGapPolicy::Preserve => break None,
                DrainGapPolicy::Close => {
                    if let Some(live) = self.buffer.subscribe_if_caught_up(self.index) {
                        break Some(live);
                    }
                }
            }
        };

        log::info!(
            "{} Worker finished sending events ({} drained)",
            self.role,
            self.index - drained_from
        );

        if let Some(signal) = &self.trigger {
            log::info!("Triggering backup worker");
            signal.fire()?;
        }

        Ok(caught_up.unwrap_or_else(|| self.buffer.subscribe()))
    }

    async fn await_permit(&mut self) {
        let limiter = self.limiter.clone();
        loop {
            let refilled = limiter.refilled();
            if limiter.allow() {
                break;
            }

            self.set_state(WorkerState::AwaitingPermit);
            log::warn!("{} rate-limited, sleeping...", self.role);
            match self.backoff {
                BackoffPolicy::Fixed(delay) => tokio::time::sleep(delay).await,
                BackoffPolicy::UntilRefill => refilled.await,
            }
        }
        self.set_state(WorkerState::Draining);
    }

    async fn pass_through(
        &mut self,
        mut live: LiveFeed,
    ) -> Result<(), RelayError> {
        self.set_state(WorkerState::PassThrough);
        log::info!("{} Worker relaying live ingress frames", self.role);

        loop {
            match live.recv().await {
                Some(LiveFrame::Frame(frame)) => {
                    if let Err(e) = self.sink.send(frame).await {
                        log::error!("{} idle proxy: provider disconnected: {}", self.role, e);
                        return Err(e);
                    }
                }
                Some(LiveFrame::Disconnected) | None => {
                    log::warn!("{} idle proxy: app disconnected", self.role);
                    return Err(RelayError::IngressClosed);
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        self.sink.send(frame).await.map_err(|e| {
            log::error!("{} worker write error: {}", self.role, e);
            e
        })
    }

    fn set_state(&self, next: WorkerState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            log::debug!("{} worker {:?} -> {:?}", self.role, *state, next);
            *state = next;
            true
        });
    }
}
