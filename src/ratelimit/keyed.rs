//! Independent token buckets addressed by key.

use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::bucket::{Admission, TokenBucket};
use super::clock::{Clock, MonotonicClock};
use crate::config::BucketConfig;
use crate::error::Result;

/// A registry of token buckets, one per key.
///
/// Buckets are created lazily from a shared template the first time a key
/// is seen. Each bucket is independent: there is no fairness or shared
/// budget across keys.
///
/// Map shards are never locked while a caller waits for tokens; blocking
/// operations clone the bucket handle out of the map first.
pub struct KeyedBuckets<K, C = MonotonicClock>
where
    K: Eq + Hash,
    C: Clock + Clone,
{
    /// Buckets indexed by key
    buckets: DashMap<K, Arc<TokenBucket<C>>>,
    /// Parameters for newly created buckets
    template: BucketConfig,
    /// Clock handed to every bucket
    clock: C,
}

impl<K> KeyedBuckets<K, MonotonicClock>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create a registry whose buckets use the monotonic clock.
    pub fn new(template: BucketConfig) -> Result<Self> {
        Self::with_clock(template, MonotonicClock)
    }
}

impl<K, C> KeyedBuckets<K, C>
where
    K: Eq + Hash + Clone + Display,
    C: Clock + Clone,
{
    /// Create a registry whose buckets share `clock`.
    ///
    /// The template is validated once here.
    pub fn with_clock(template: BucketConfig, clock: C) -> Result<Self> {
        template.validate()?;
        Ok(Self {
            buckets: DashMap::new(),
            template,
            clock,
        })
    }

    /// The parameters used for new buckets.
    pub fn template(&self) -> &BucketConfig {
        &self.template
    }

    /// Get the bucket for `key`, creating it if needed.
    pub fn bucket(&self, key: &K) -> Arc<TokenBucket<C>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let entry = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "Creating token bucket for key");
            Arc::new(TokenBucket::from_validated(
                self.template.rate,
                self.template.capacity,
                self.template.initial_tokens,
                self.clock.clone(),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Consume `tokens` from `key`'s bucket if available.
    pub fn allow(&self, key: &K, tokens: f64) -> bool {
        trace!(key = %key, requested = tokens, "Checking keyed bucket");
        self.bucket(key).allow(tokens)
    }

    /// Consume `tokens` from `key`'s bucket, reporting the wait if denied.
    pub fn try_consume(&self, key: &K, tokens: f64) -> Admission {
        self.bucket(key).try_consume(tokens)
    }

    /// Tokens currently available for `key`.
    pub fn available_tokens(&self, key: &K) -> f64 {
        self.bucket(key).available_tokens()
    }

    /// Block until `tokens` are consumed from `key`'s bucket.
    pub fn wait_and_consume(&self, key: &K, tokens: f64) -> Result<Duration> {
        let bucket = self.bucket(key);
        bucket.wait_and_consume(tokens)
    }

    /// Async wait on `key`'s bucket.
    pub async fn wait_and_consume_async(&self, key: &K, tokens: f64) -> Result<Duration> {
        let bucket = self.bucket(key);
        bucket.wait_and_consume_async(tokens).await
    }

    /// Refill `key`'s bucket to capacity, if it exists.
    pub fn reset(&self, key: &K) {
        if let Some(bucket) = self.buckets.get(key) {
            bucket.reset();
        }
    }

    /// Drop `key`'s bucket. Returns whether it existed.
    ///
    /// Callers still holding the bucket keep using the detached instance.
    pub fn remove(&self, key: &K) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Number of buckets created so far.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket has been created yet.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every bucket.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TokenGuardError;
    use crate::ratelimit::clock::ManualClock;
    use std::thread;

    fn manual_registry(
        rate: f64,
        capacity: f64,
    ) -> (KeyedBuckets<String, ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let registry =
            KeyedBuckets::with_clock(BucketConfig::new(rate, capacity), clock.clone()).unwrap();
        (registry, clock)
    }

    #[test]
    fn test_registry_creation() {
        let registry: KeyedBuckets<String> =
            KeyedBuckets::new(BucketConfig::new(1.0, 5.0)).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.template().capacity, 5.0);
    }

    #[test]
    fn test_invalid_template_rejected() {
        let result: Result<KeyedBuckets<String>> = KeyedBuckets::new(BucketConfig::new(-1.0, 5.0));
        assert!(matches!(
            result,
            Err(TokenGuardError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_keys_have_independent_buckets() {
        let (registry, _clock) = manual_registry(1.0, 3.0);
        let alice = "alice".to_string();
        let bob = "bob".to_string();

        assert!(registry.allow(&alice, 3.0));
        assert!(!registry.allow(&alice, 1.0));

        assert!(registry.allow(&bob, 2.0));
        assert_eq!(registry.available_tokens(&bob), 1.0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_buckets_share_clock() {
        let (registry, clock) = manual_registry(2.0, 10.0);
        let key = "client".to_string();

        assert!(registry.allow(&key, 10.0));
        clock.advance(Duration::from_secs(2));

        assert!((registry.available_tokens(&key) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_try_consume_reports_wait() {
        let (registry, _clock) = manual_registry(2.0, 10.0);
        let key = "client".to_string();

        assert!(registry.allow(&key, 10.0));
        let outcome = registry.try_consume(&key, 4.0);
        assert!((outcome.wait_seconds() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_wait_and_consume_per_key() {
        let (registry, clock) = manual_registry(5.0, 5.0);
        let key = "client".to_string();

        assert!(registry.allow(&key, 5.0));
        let waited = registry.wait_and_consume(&key, 3.0).unwrap();

        assert!((waited.as_secs_f64() - 0.6).abs() < 1e-3);
        assert!((clock.elapsed().as_secs_f64() - 0.6).abs() < 1e-3);
    }

    #[test]
    fn test_reset_and_remove() {
        let (registry, _clock) = manual_registry(1.0, 4.0);
        let key = "client".to_string();

        assert!(registry.allow(&key, 4.0));
        registry.reset(&key);
        assert_eq!(registry.available_tokens(&key), 4.0);

        assert!(registry.remove(&key));
        assert!(!registry.remove(&key));
        assert!(registry.is_empty());

        // Reset of an unknown key does not create a bucket
        registry.reset(&key);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear() {
        let (registry, _clock) = manual_registry(1.0, 4.0);
        for key in ["a", "b", "c"] {
            registry.allow(&key.to_string(), 1.0);
        }
        assert_eq!(registry.len(), 3);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_waiting_does_not_block_other_keys() {
        let registry = Arc::new(
            KeyedBuckets::<String>::new(BucketConfig {
                rate: 2.0,
                capacity: 1.0,
                initial_tokens: Some(0.0),
            })
            .unwrap(),
        );

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.wait_and_consume(&"slow".to_string(), 1.0))
        };

        thread::sleep(Duration::from_millis(20));
        // Other keys remain usable while the waiter sleeps
        let other = "other".to_string();
        registry.reset(&other);
        assert!(!registry.allow(&other, 1.0));
        assert_eq!(registry.len(), 2);

        assert!(waiter.join().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_async_wait_per_key() {
        let registry: KeyedBuckets<String> =
            KeyedBuckets::new(BucketConfig::new(50.0, 1.0)).unwrap();
        let key = "client".to_string();

        assert!(registry.allow(&key, 1.0));
        let waited = registry.wait_and_consume_async(&key, 1.0).await.unwrap();
        assert!(waited >= Duration::from_millis(15));
    }
}
