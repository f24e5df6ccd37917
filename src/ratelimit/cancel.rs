//! Cancellation signal for interrupting token waits.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken as AsyncToken;

/// A cloneable, one-shot cancellation signal.
///
/// All clones observe the same state. Once cancelled, a token stays
/// cancelled. Cancellation state and async waiting come from
/// [`tokio_util::sync::CancellationToken`]; a condition variable on top lets
/// blocking threads in `wait_and_consume_cancellable` be woken as well.
#[derive(Clone, Default)]
pub struct CancellationToken {
    token: AsyncToken,
    blocking: Arc<BlockingWaiters>,
}

#[derive(Default)]
struct BlockingWaiters {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token and wake every waiter.
    pub fn cancel(&self) {
        {
            // Held so a blocking waiter cannot miss the wakeup between its
            // check and its wait.
            let _guard = self.blocking.lock.lock();
            self.token.cancel();
        }
        self.blocking.condvar.notify_all();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Block the current thread for up to `timeout`.
    ///
    /// Returns `true` if the token was cancelled before or during the wait,
    /// `false` if the full timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.blocking.lock.lock();
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while !self.token.is_cancelled() {
                    if self.blocking.condvar.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
            }
            // Deadline not representable: wait for cancellation alone.
            None => {
                while !self.token.is_cancelled() {
                    self.blocking.condvar.wait(&mut guard);
                }
            }
        }
        self.token.is_cancelled()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
