//! Engine settings, decoupled from how the binary parses them.

use std::str::FromStr;
use std::time::Duration;

use crate::error::RelayError;

/// How a worker waits after the rate limiter denies a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Sleep a fixed duration, unsynchronized with the refill tick.
    Fixed(Duration),
    /// Sleep until the limiter's next refill tick.
    UntilRefill,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(Duration::from_secs(60))
    }
}

/// What happens to events appended between a worker's last caught-up check
/// and the start of its pass-through phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DrainGapPolicy {
    /// Subscribe to the live feed only after the drain has finished and the
    /// failover has fired. Events that land in between are lost for that worker.
    #[default]
    Preserve,
    /// Take the final length check and the live feed subscription under the
    /// same buffer lock, so nothing falls between drain and pass-through.
    Close,
}

impl FromStr for DrainGapPolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preserve" => Ok(DrainGapPolicy::Preserve),
            "close" => Ok(DrainGapPolicy::Close),
            other => Err(RelayError::InvalidConfig(format!(
                "unknown drain gap policy '{other}' (expected 'preserve' or 'close')"
            ))),
        }
    }
}

/// Everything the engine needs besides its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub primary_url: String,
    pub backup_url: String,
    /// Permits granted per refill interval.
    pub rate_max: u32,
    pub rate_interval: Duration,
    pub backoff: BackoffPolicy,
    pub drain_gap: DrainGapPolicy,
    /// Frames a pass-through subscriber may fall behind before it skips ahead.
    pub live_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            primary_url: "ws://provider/main".to_string(),
            backup_url: "ws://provider/backup".to_string(),
            rate_max: 100,
            rate_interval: Duration::from_secs(60 * 60),
            backoff: BackoffPolicy::default(),
            drain_gap: DrainGapPolicy::default(),
            live_capacity: 1024,
        }
    }
}

impl RelaySettings {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.rate_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "rate limiter interval must be positive".to_string(),
            ));
        }
        if let BackoffPolicy::Fixed(delay) = self.backoff {
            if delay.is_zero() {
                return Err(RelayError::InvalidConfig(
                    "rate limit backoff must be positive".to_string(),
                ));
            }
        }
        if self.live_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "live feed capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
