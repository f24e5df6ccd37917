//! Token bucket implementation.

use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::cancel::CancellationToken;
use super::clock::{Clock, MonotonicClock};
use crate::error::{Result, TokenGuardError};

/// Shortest sleep between re-checks while waiting for tokens.
///
/// A shortfall left over from float rounding would otherwise convert to a
/// zero-length sleep.
const MIN_WAIT: Duration = Duration::from_micros(1);

/// Outcome of a non-blocking consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// The tokens were consumed.
    Granted,
    /// Not enough tokens yet.
    ///
    /// `wait_seconds` is how long this request would have to wait if no
    /// other caller consumed tokens in the meantime. Treat it as a lower
    /// bound.
    Deferred { wait_seconds: f64 },
    /// More tokens were requested than the bucket can ever hold.
    Unsatisfiable,
}

impl Admission {
    /// Whether the tokens were consumed.
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    /// Seconds to wait before retrying: zero when granted, infinite when the
    /// request can never succeed.
    pub fn wait_seconds(&self) -> f64 {
        match self {
            Admission::Granted => 0.0,
            Admission::Deferred { wait_seconds } => *wait_seconds,
            Admission::Unsatisfiable => f64::INFINITY,
        }
    }

    /// The wait as a [`Duration`], or `None` if the request can never succeed.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Admission::Unsatisfiable => None,
            other => Some(duration_from_secs(other.wait_seconds())),
        }
    }
}

/// A token bucket rate limiter.
///
/// The bucket holds up to `capacity` tokens and accrues `rate` tokens per
/// second of elapsed time. Refill is lazy: every operation first brings the
/// token count up to date as of the clock's current instant, in the same
/// critical section as any consumption that follows.
///
/// This struct is thread-safe. Share it by reference or wrap it in an
/// [`Arc`](std::sync::Arc).
pub struct TokenBucket<C: Clock = MonotonicClock> {
    /// Maximum number of tokens the bucket can hold
    capacity: f64,
    /// Tokens added per second
    rate: f64,
    /// Time source used for refills and waits
    clock: C,
    /// Token count and refill instant, always updated together
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket<MonotonicClock> {
    /// Create a full bucket driven by the monotonic wall clock.
    pub fn new(rate: f64, capacity: f64) -> Result<Self> {
        Self::with_clock(rate, capacity, None, MonotonicClock)
    }

    /// Create a bucket starting with `initial_tokens` tokens.
    pub fn with_initial_tokens(rate: f64, capacity: f64, initial_tokens: f64) -> Result<Self> {
        Self::with_clock(rate, capacity, Some(initial_tokens), MonotonicClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a bucket with an explicit time source.
    ///
    /// `initial_tokens` defaults to `capacity`. Fails with
    /// [`TokenGuardError::InvalidConfiguration`] when `rate` or `capacity` is
    /// not a positive finite number, or when `initial_tokens` is outside
    /// `[0, capacity]`.
    pub fn with_clock(
        rate: f64,
        capacity: f64,
        initial_tokens: Option<f64>,
        clock: C,
    ) -> Result<Self> {
        validate_parameters(rate, capacity, initial_tokens)?;
        Ok(Self::from_validated(rate, capacity, initial_tokens, clock))
    }

    /// Build a bucket from parameters that already passed `validate_parameters`.
    pub(crate) fn from_validated(
        rate: f64,
        capacity: f64,
        initial_tokens: Option<f64>,
        clock: C,
    ) -> Self {
        let tokens = initial_tokens.unwrap_or(capacity);
        let last_refill_at = clock.now();

        debug!(rate, capacity, tokens, "Creating token bucket");

        Self {
            capacity,
            rate,
            clock,
            state: Mutex::new(BucketState {
                tokens,
                last_refill_at,
            }),
        }
    }

    /// Maximum number of tokens the bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// The bucket's time source.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Whether a request for `tokens` could ever be granted by this bucket.
    ///
    /// Negative and NaN requests are never satisfiable.
    pub fn is_satisfiable(&self, tokens: f64) -> bool {
        tokens >= 0.0 && tokens <= self.capacity
    }

    /// Refill, then return the current token count.
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Consume `tokens` if they are available right now.
    ///
    /// Returns `false` without consuming anything otherwise. Requests larger
    /// than the capacity always return `false`.
    pub fn allow(&self, tokens: f64) -> bool {
        self.try_consume(tokens).is_granted()
    }

    /// Consume `tokens` if available, reporting how long to wait if not.
    pub fn try_consume(&self, tokens: f64) -> Admission {
        if !self.is_satisfiable(tokens) {
            debug!(
                requested = tokens,
                capacity = self.capacity,
                "Request can never be satisfied"
            );
            return Admission::Unsatisfiable;
        }

        let mut state = self.state.lock();
        self.refill(&mut state);

        trace!(
            requested = tokens,
            available = state.tokens,
            "Checking token bucket"
        );

        if state.tokens >= tokens {
            state.tokens -= tokens;
            Admission::Granted
        } else {
            let wait_seconds = ((tokens - state.tokens) / self.rate).max(0.0);
            debug!(
                requested = tokens,
                available = state.tokens,
                wait_seconds,
                "Token bucket denied request"
            );
            Admission::Deferred { wait_seconds }
        }
    }

    /// Block until `tokens` can be consumed, then consume them.
    ///
    /// Returns how long the call waited. The lock is released while
    /// sleeping; after each sleep the bucket is re-checked, since other
    /// callers may have drained it in the meantime. Fails immediately with
    /// [`TokenGuardError::UnsatisfiableRequest`] if `tokens` exceeds the
    /// capacity.
    pub fn wait_and_consume(&self, tokens: f64) -> Result<Duration> {
        self.wait_blocking(tokens, None)
    }

    /// Like [`wait_and_consume`](Self::wait_and_consume), but gives up with
    /// [`TokenGuardError::Cancelled`] when `cancel` fires during a wait.
    ///
    /// No tokens are consumed when the wait is cancelled.
    pub fn wait_and_consume_cancellable(
        &self,
        tokens: f64,
        cancel: &CancellationToken,
    ) -> Result<Duration> {
        self.wait_blocking(tokens, Some(cancel))
    }

    /// Async counterpart of [`wait_and_consume`](Self::wait_and_consume).
    ///
    /// Suspends through [`Clock::sleep_async`], so virtual clocks are
    /// advanced instead of waited on.
    pub async fn wait_and_consume_async(&self, tokens: f64) -> Result<Duration> {
        self.wait_and_consume_until(tokens, std::future::pending::<()>())
            .await
    }

    /// Async wait that is abandoned when `shutdown` completes.
    ///
    /// Each sleep races against `shutdown`; if it resolves first the call
    /// fails with [`TokenGuardError::Cancelled`] and nothing is consumed.
    pub async fn wait_and_consume_until<F>(&self, tokens: f64, shutdown: F) -> Result<Duration>
    where
        F: Future<Output = ()>,
    {
        self.ensure_satisfiable(tokens)?;
        tokio::pin!(shutdown);

        let started = self.clock.now();
        loop {
            match self.try_consume(tokens) {
                Admission::Granted => return Ok(self.finish_wait(tokens, started)),
                Admission::Deferred { wait_seconds } => {
                    tokio::select! {
                        _ = self.clock.sleep_async(sleep_duration(wait_seconds)) => {}
                        _ = &mut shutdown => {
                            debug!(requested = tokens, "Token wait cancelled");
                            return Err(TokenGuardError::Cancelled);
                        }
                    }
                }
                Admission::Unsatisfiable => return Err(self.unsatisfiable(tokens)),
            }
        }
    }

    /// Refill the bucket to capacity and restart refill accounting from now.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.tokens = self.capacity;
        state.last_refill_at = state.last_refill_at.max(now);
        debug!(capacity = self.capacity, "Token bucket reset");
    }

    fn wait_blocking(&self, tokens: f64, cancel: Option<&CancellationToken>) -> Result<Duration> {
        self.ensure_satisfiable(tokens)?;

        let started = self.clock.now();
        loop {
            match self.try_consume(tokens) {
                Admission::Granted => return Ok(self.finish_wait(tokens, started)),
                Admission::Deferred { wait_seconds } => {
                    let pause = sleep_duration(wait_seconds);
                    match cancel {
                        Some(cancel) => {
                            if self.clock.sleep_cancellable(pause, cancel) {
                                debug!(requested = tokens, "Token wait cancelled");
                                return Err(TokenGuardError::Cancelled);
                            }
                        }
                        None => self.clock.sleep(pause),
                    }
                }
                Admission::Unsatisfiable => return Err(self.unsatisfiable(tokens)),
            }
        }
    }

    /// Apply the refill owed since `last_refill_at`.
    ///
    /// A clock observed moving backward accrues nothing and leaves
    /// `last_refill_at` where it was.
    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        match now.checked_duration_since(state.last_refill_at) {
            Some(elapsed) => {
                let accrued = self.rate * elapsed.as_secs_f64();
                state.tokens = (state.tokens + accrued).min(self.capacity);
                state.last_refill_at = now;
            }
            None => trace!("Clock moved backward, skipping refill"),
        }
    }

    fn finish_wait(&self, tokens: f64, started: Instant) -> Duration {
        let waited = self.clock.now().saturating_duration_since(started);
        debug!(
            requested = tokens,
            waited_ms = waited.as_millis() as u64,
            "Tokens consumed after waiting"
        );
        waited
    }

    fn ensure_satisfiable(&self, tokens: f64) -> Result<()> {
        if self.is_satisfiable(tokens) {
            Ok(())
        } else {
            Err(self.unsatisfiable(tokens))
        }
    }

    fn unsatisfiable(&self, tokens: f64) -> TokenGuardError {
        TokenGuardError::UnsatisfiableRequest {
            requested: tokens,
            capacity: self.capacity,
        }
    }
}

impl<C: Clock> std::fmt::Debug for TokenBucket<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("rate", &self.rate)
            .field("tokens", &state.tokens)
            .finish()
    }
}

/// Check bucket parameters before construction.
pub(crate) fn validate_parameters(
    rate: f64,
    capacity: f64,
    initial_tokens: Option<f64>,
) -> Result<()> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(TokenGuardError::InvalidConfiguration(format!(
            "rate must be a positive finite number, got {}",
            rate
        )));
    }
    if !(capacity.is_finite() && capacity > 0.0) {
        return Err(TokenGuardError::InvalidConfiguration(format!(
            "capacity must be a positive finite number, got {}",
            capacity
        )));
    }
    if let Some(initial) = initial_tokens {
        if !(initial >= 0.0 && initial <= capacity) {
            return Err(TokenGuardError::InvalidConfiguration(format!(
                "initial_tokens must be within [0, {}], got {}",
                capacity, initial
            )));
        }
    }
    Ok(())
}

fn duration_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

fn sleep_duration(wait_seconds: f64) -> Duration {
    duration_from_secs(wait_seconds).max(MIN_WAIT)
}
