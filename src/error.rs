//! Error types for Warden.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Warden operations.
///
/// Only construction and configuration APIs return this. Admission checks
/// always resolve to a `RateLimitResult`.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter backend errors surfaced during setup
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure talking to a counter backend.
///
/// The limiter core treats every variant the same way: the backend could not
/// be consulted, so the check falls back per policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transport or command-level failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The round trip did not complete within the configured bound.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    /// The store replied with something that is not `(count, ttl)`.
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
