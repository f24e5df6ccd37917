//! Tokenguard - Token Bucket Rate Limiting
//!
//! This crate implements a concurrency-safe token bucket: a shared guard that
//! admits work according to a steady refill rate and a burst capacity.
//! Callers can query availability, attempt a non-blocking consumption, or
//! wait (blocking or async) until enough tokens accumulate.
//!
//! ```
//! use tokenguard::ratelimit::TokenBucket;
//!
//! let bucket = TokenBucket::new(2.0, 10.0).unwrap();
//! assert!(bucket.allow(5.0));
//! assert!(!bucket.try_consume(11.0).is_granted());
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
