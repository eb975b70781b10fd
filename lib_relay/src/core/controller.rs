//! # Relay Controller
//!
//! The aggregate root of the relay. One `Controller` is created at startup and
//! every task receives an `Arc` handle to it; there is no global state.
//!
//! ## Startup Sequence
//!
//! 1. [`Controller::new`] builds the buffer, the rate limiter (its refill task
//!    starts right away) and the failover signal.
//! 2. [`Controller::start`] spawns two critical tasks:
//!    - `dial-primary` connects the primary provider and starts its worker with
//!      the failover trigger.
//!    - `failover-coordinator` blocks on the failover signal, then connects the
//!      backup provider and starts its worker directly in pass-through.
//! 3. Every accepted producer connection is handed to
//!    [`Controller::attach_ingress`], which replaces the current ingress handle
//!    (without closing the previous connection) and spawns its reader. Ended
//!    readers of earlier connections are dropped from the supervisor then.
//!
//! A failed dial is reported on the supervisor's fatal channel; everything else
//! only ends the task that failed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio::sync::watch;

use crate::core::event::{BoxFrameSink, Frame};
use crate::core::event_buffer::EventBuffer;
use crate::core::failover::FailoverSignal;
use crate::core::ingress_gateway::IngressGateway;
use crate::core::provider_worker::{ProviderRole, ProviderWorker, StartPhase, WorkerState};
use crate::core::rate_limiter::RateLimiter;
use crate::core::settings::RelaySettings;
use crate::core::supervisor::Supervisor;
use crate::error::RelayError;

/// Opens outbound provider connections.
pub trait ProviderConnector: Send + Sync + 'static {
    /// Dials `endpoint`. Errors should be `RelayError::Dial`.
    fn connect(&self, endpoint: &str) -> impl Future<Output = Result<BoxFrameSink, RelayError>> + Send;
}

/// The producer connection currently considered "the" ingress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressHandle {
    pub id: u64,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
}

/// A provider connection that was dialed successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHandle {
    pub role: ProviderRole,
    pub endpoint: String,
    pub connected_at: DateTime<Utc>,
}

pub struct Controller<C> {
    settings: RelaySettings,
    connector: C,
    buffer: Arc<EventBuffer>,
    limiter: Arc<RateLimiter>,
    failover: Arc<FailoverSignal>,
    supervisor: Supervisor,
    ingress: Mutex<Option<IngressHandle>>,
    next_ingress_id: AtomicU64,
    providers: Mutex<HashMap<ProviderRole, ProviderHandle>>,
    worker_states: Mutex<HashMap<ProviderRole, watch::Receiver<WorkerState>>>,
}

impl<C: ProviderConnector> Controller<C> {
    /// Validates `settings` and builds the shared state. Must run inside a
    /// tokio runtime because the rate limiter starts its refill task here.
    pub fn new(settings: RelaySettings, connector: C) -> Result<Arc<Self>, RelayError> {
        settings.validate()?;
        let limiter = RateLimiter::new(settings.rate_max, settings.rate_interval)?;

        Ok(Arc::new(Self {
            buffer: Arc::new(EventBuffer::new(settings.live_capacity)),
            limiter,
            failover: Arc::new(FailoverSignal::new()),
            supervisor: Supervisor::new(),
            ingress: Mutex::new(None),
            next_ingress_id: AtomicU64::new(1),
            providers: Mutex::new(HashMap::new()),
            worker_states: Mutex::new(HashMap::new()),
            settings,
            connector,
        }))
    }

    /// Spawns the primary dial and the failover coordinator.
    pub fn start(self: &Arc<Self>) {
        let controller = self.clone();
        self.supervisor.spawn_critical("dial-primary", async move {
            controller.start_provider(ProviderRole::Primary).await
        });

        let controller = self.clone();
        self.supervisor.spawn_critical("failover-coordinator", async move {
            controller.failover.wait().await?;
            log::info!("Failover signal received, bringing up backup provider");
            controller.start_provider(ProviderRole::Backup).await
        });
    }

    async fn start_provider(&self, role: ProviderRole) -> Result<(), RelayError> {
        let endpoint = match role {
            ProviderRole::Primary => self.settings.primary_url.clone(),
            ProviderRole::Backup => self.settings.backup_url.clone(),
        };

        log::info!("Connecting {} provider: {}", role, endpoint);
        let sink = self.connector.connect(&endpoint).await.map_err(|e| {
            log::error!("{} provider connection failed: {}", role, e);
            e
        })?;

        self.lock_providers().insert(
            role,
            ProviderHandle {
                role,
                endpoint,
                connected_at: Utc::now(),
            },
        );

        let worker = ProviderWorker::new(role, sink, self.buffer.clone(), self.limiter.clone())
            .with_backoff(self.settings.backoff)
            .with_drain_gap(self.settings.drain_gap);
        let worker = match role {
            ProviderRole::Primary => worker.with_trigger(self.failover.clone()),
            ProviderRole::Backup => worker.starting_in(StartPhase::PassThrough),
        };

        self.lock_worker_states().insert(role, worker.subscribe_state());
        self.supervisor.spawn(role.worker_task(), worker.run());
        Ok(())
    }

    /// Takes over a newly upgraded producer connection and spawns its reader.
    ///
    /// The previous handle, if any, is overwritten: its connection is neither
    /// drained nor closed and its reader keeps running.
    pub fn attach_ingress<St>(self: &Arc<Self>, peer: impl Into<String>, source: St) -> u64
    where
        St: Stream<Item = Result<Frame, RelayError>> + Send + Unpin + 'static,
    {
        let id = self.next_ingress_id.fetch_add(1, Ordering::Relaxed);
        let handle = IngressHandle {
            id,
            peer: peer.into(),
            connected_at: Utc::now(),
        };

        log::info!("App connected from {} (connection {})", handle.peer, id);
        if let Some(previous) = self.lock_ingress().replace(handle) {
            log::warn!(
                "App connection {} from {} replaced by connection {} without draining it",
                previous.id,
                previous.peer,
                id
            );
        }

        // Readers of earlier connections that have ended leave no trace.
        self.supervisor.forget_finished("ingress-");

        let controller = self.clone();
        self.supervisor.spawn(format!("ingress-{id}"), async move {
            let result = IngressGateway::new(id, controller.buffer.clone())
                .run(source)
                .await;
            if controller.is_current_ingress(id) {
                controller.buffer.publish_disconnect().await;
            }
            result
        });
        id
    }

    fn is_current_ingress(&self, id: u64) -> bool {
        self.lock_ingress().as_ref().is_some_and(|h| h.id == id)
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn failover(&self) -> &Arc<FailoverSignal> {
        &self.failover
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn ingress_handle(&self) -> Option<IngressHandle> {
        self.lock_ingress().clone()
    }

    pub fn provider_handle(&self, role: ProviderRole) -> Option<ProviderHandle> {
        self.lock_providers().get(&role).cloned()
    }

    /// State of the worker for `role`, once its provider has been dialed.
    pub fn worker_state(&self, role: ProviderRole) -> Option<watch::Receiver<WorkerState>> {
        self.lock_worker_states().get(&role).cloned()
    }

    fn lock_ingress(&self) -> std::sync::MutexGuard<'_, Option<IngressHandle>> {
        self.ingress.lock().expect("Ingress handle lock poisoned")
    }

    fn lock_worker_states(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ProviderRole, watch::Receiver<WorkerState>>> {
        self.worker_states.lock().expect("Worker state lock poisoned")
    }

    fn lock_providers(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderRole, ProviderHandle>> {
        self.providers.lock().expect("Provider handle lock poisoned")
    }
}
