//! Time sources for token buckets.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::cancel::CancellationToken;

/// A source of time and a way to pass it.
///
/// Buckets read `now` for every refill and call `sleep` (or `sleep_async`)
/// while waiting for tokens, always outside their lock.
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);

    /// Block for `duration` unless `cancel` fires first.
    ///
    /// Returns `true` if the token was cancelled.
    fn sleep_cancellable(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        cancel.wait_timeout(duration)
    }

    /// Suspend the calling task for `duration`.
    async fn sleep_async(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Wall-clock time from [`Instant::now`] with real thread sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

#[async_trait]
impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A manually driven clock for deterministic tests and simulations.
///
/// Clones share the same virtual time. Sleeping advances virtual time
/// immediately instead of blocking.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock whose virtual time starts at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_add(duration);
    }

    /// Move virtual time backward, never before the clock's starting point.
    pub fn rewind(&self, duration: Duration) {
        let mut offset = self.offset.lock();
        *offset = offset.saturating_sub(duration);
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn sleep_cancellable(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        self.advance(duration);
        false
    }

    async fn sleep_async(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
