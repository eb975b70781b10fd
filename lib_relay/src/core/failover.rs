//! # Failover Signal
//!
//! The one-shot handover between the primary worker (which fires it once its
//! drain is complete) and the backup setup routine (which waits on it before
//! dialing the backup provider).
//!
//! The signal latches: a fire that happens before anyone waits is not lost. A
//! second fire, or a second waiter, is rejected with an error instead of being
//! silently accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::RelayError;

#[derive(Default)]
pub struct FailoverSignal {
    fired: AtomicBool,
    claimed: AtomicBool,
    fired_at: OnceLock<Instant>,
    notify: Notify,
}

impl FailoverSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Only the first call succeeds.
    pub fn fire(&self) -> Result<(), RelayError> {
        if self.fired.swap(true, Ordering::AcqRel) {
            return Err(RelayError::FailoverAlreadyFired);
        }
        let _ = self.fired_at.set(Instant::now());
        // notify_one stores a permit when nobody is waiting yet.
        self.notify.notify_one();
        Ok(())
    }

    /// Waits until the signal has fired. Only one caller may ever wait.
    pub async fn wait(&self) -> Result<(), RelayError> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(RelayError::FailoverAlreadyClaimed);
        }
        while !self.is_fired() {
            self.notify.notified().await;
        }
        Ok(())
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// When the signal fired, if it has.
    pub fn fired_at(&self) -> Option<Instant> {
        self.fired_at.get().copied()
    }
}
