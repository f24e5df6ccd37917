//! Admission control trait for abstracting over limiter implementations.

use async_trait::async_trait;
use std::time::Duration;

use super::bucket::{Admission, TokenBucket};
use super::clock::Clock;
use crate::error::Result;

/// Trait for admission control implementations.
///
/// Request-handling code can hold an `Arc<dyn AdmissionControl>` and stay
/// agnostic of the clock or bucket type behind it.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Consume `tokens` if they are available right now.
    fn allow(&self, tokens: f64) -> bool;

    /// Consume `tokens` if available, reporting the wait otherwise.
    fn try_consume(&self, tokens: f64) -> Admission;

    /// Tokens currently available.
    fn available_tokens(&self) -> f64;

    /// Wait asynchronously until `tokens` are consumed.
    async fn acquire(&self, tokens: f64) -> Result<Duration>;
}

#[async_trait]
impl<C: Clock + 'static> AdmissionControl for TokenBucket<C> {
    fn allow(&self, tokens: f64) -> bool {
        TokenBucket::allow(self, tokens)
    }

    fn try_consume(&self, tokens: f64) -> Admission {
        TokenBucket::try_consume(self, tokens)
    }

    fn available_tokens(&self) -> f64 {
        TokenBucket::available_tokens(self)
    }

    async fn acquire(&self, tokens: f64) -> Result<Duration> {
        self.wait_and_consume_async(tokens).await
    }
}
