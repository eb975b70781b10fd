//! # Token Bucket Rate Limiter
//!
//! A flow-control gate shared by every provider worker.
//!
//! ## Refill Policy
//!
//! The bucket is *reset* to `max` on every tick of its interval. It is not an
//! additive refill: permits left over from one interval are not carried into the
//! next, and a full burst of `max` is available right after every tick even if
//! the previous interval never touched the bucket.
//!
//! ## Background Task
//!
//! The refill loop is spawned on construction and holds only a `Weak` handle, so
//! it stops on the first tick after the last `Arc<RateLimiter>` is dropped.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::RelayError;

struct Bucket {
    tokens: u32,
    next_refill: Instant,
}

/// # Rate Limiter
///
/// Invariant: `0 <= tokens <= max` at all times.
pub struct RateLimiter {
    max: u32,
    interval: Duration,
    bucket: Mutex<Bucket>,
    /// Woken on every refill, for workers using `BackoffPolicy::UntilRefill`.
    refilled: Notify,
}

impl RateLimiter {
    /// Creates a full bucket and starts its refill loop.
    ///
    /// Must be called from inside a tokio runtime. The first refill happens one
    /// `interval` after construction.
    pub fn new(max: u32, interval: Duration) -> Result<Arc<Self>, RelayError> {
        if interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "rate limiter interval must be positive".to_string(),
            ));
        }

        let start = Instant::now() + interval;
        let limiter = Arc::new(Self {
            max,
            interval,
            bucket: Mutex::new(Bucket {
                tokens: max,
                next_refill: start,
            }),
            refilled: Notify::new(),
        });

        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::spawn(Self::refill_loop(Arc::downgrade(&limiter), ticker));

        Ok(limiter)
    }

    async fn refill_loop(limiter: Weak<Self>, mut ticker: Interval) {
        loop {
            ticker.tick().await;
            let Some(limiter) = limiter.upgrade() else {
                log::debug!("Rate limiter dropped, refill loop exiting");
                break;
            };
            limiter.refill();
        }
    }

    fn refill(&self) {
        {
            let mut bucket = self.lock();
            bucket.tokens = self.max;
            bucket.next_refill = Instant::now() + self.interval;
        }
        self.refilled.notify_waiters();
    }

    /// Takes one permit if any is left. Never blocks.
    pub fn allow(&self) -> bool {
        let mut bucket = self.lock();
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Resolves at the next refill tick.
    ///
    /// The returned future already observes refills that happen after this call
    /// returns, so create it *before* calling [`allow`](Self::allow) to avoid
    /// missing a tick between a denial and the wait.
    pub fn refilled(&self) -> Notified<'_> {
        self.refilled.notified()
    }

    /// Permits currently available.
    pub fn tokens(&self) -> u32 {
        self.lock().tokens
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the bucket will next be reset to `max`.
    pub fn next_refill(&self) -> Instant {
        self.lock().next_refill
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().expect("Rate limiter lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn grants_at_most_max_per_interval() {
        let limiter = RateLimiter::new(2, Duration::from_millis(10)).unwrap();

        let grants = (0..5).filter(|_| limiter.allow()).count();
        assert_eq!(grants, 2);
        assert_eq!(limiter.tokens(), 0);

        tokio::time::sleep(Duration::from_millis(15)).await;

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_resets_instead_of_accumulating() {
        let limiter = RateLimiter::new(3, Duration::from_millis(10)).unwrap();
        assert!(limiter.allow());

        // Several ticks pass with the bucket mostly unused.
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(limiter.tokens(), 3);

        let grants = (0..10).filter(|_| limiter.allow()).count();
        assert_eq!(grants, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refilled_wakes_on_next_tick() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50)).unwrap();
        assert!(limiter.allow());

        let start = Instant::now();
        let wake = limiter.refilled();
        assert!(!limiter.allow());
        wake.await;

        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(limiter.allow());
    }

    #[tokio::test]
    async fn rejects_zero_interval() {
        assert!(matches!(
            RateLimiter::new(10, Duration::ZERO),
            Err(RelayError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn next_refill_moves_forward_each_tick() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20)).unwrap();
        let first = limiter.next_refill();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(limiter.next_refill(), first + Duration::from_millis(20));
    }
}
