//! Error types for tokenguard.

use thiserror::Error;

/// Main error type for tokenguard operations.
///
/// Denial of a non-blocking request is not an error: `allow` and
/// `try_consume` report it through their return values.
#[derive(Error, Debug)]
pub enum TokenGuardError {
    /// Bucket parameters are out of range (rate, capacity or initial tokens)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The request asks for more tokens than the bucket can ever hold
    #[error("Unsatisfiable request: {requested} tokens requested, capacity is {capacity}")]
    UnsatisfiableRequest { requested: f64, capacity: f64 },

    /// A blocking wait was interrupted before any tokens were consumed
    #[error("Wait cancelled before tokens were consumed")]
    Cancelled,

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tokenguard operations.
pub type Result<T> = std::result::Result<T, TokenGuardError>;
