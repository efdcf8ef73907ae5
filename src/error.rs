//! Error types for the Tollgate admission-control engine.
//!
//! Rate-limit denials are not errors; they are reported through
//! [`RateLimitDecision`](crate::ratelimit::RateLimitDecision).

use std::time::Duration;
use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Malformed tier limits or settings. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller supplied an identity that cannot be used as a partition key.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// The counter store could not be reached or rejected the operation.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A counter store call did not complete within its time budget.
    #[error("Counter store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// An alert sink could not accept a batch.
    #[error("Alert delivery failed: {0}")]
    AlertDelivery(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Postgres errors
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl TollgateError {
    /// Whether this error comes from the counter store layer.
    ///
    /// Store failures are recovered by failing open; everything else is
    /// propagated to the caller.
    pub fn is_store_failure(&self) -> bool {
        match self {
            TollgateError::StoreUnavailable(_) | TollgateError::StoreTimeout(_) => true,
            #[cfg(feature = "postgres")]
            TollgateError::Database(_) => true,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(e: config::ConfigError) -> Self {
        TollgateError::Config(e.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
