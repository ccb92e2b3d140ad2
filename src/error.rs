//! Error types for the Turnstile admission service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    /// Tracker storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Faults raised by a tracker store or the wire client underneath it.
///
/// Rejections are not faults and never appear here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A concurrent writer committed first.
    #[error("transaction conflict")]
    Conflict,

    /// The caller's deadline elapsed before the backend answered.
    #[error("storage deadline exceeded")]
    DeadlineExceeded,

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Conflict | StorageError::DeadlineExceeded)
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
