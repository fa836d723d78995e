//! Error types for the tablet subsystem.

use thiserror::Error;

/// Result type alias for tablet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tablet subsystem.
#[derive(Error, Debug)]
pub enum Error {
    /// User-visible constraint violation (e.g. altering a system keyspace).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or contradictory replication settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Requested replication factor exceeds the live hosts in a datacenter.
    #[error("not enough nodes in datacenter {dc}: requested {requested}, available {available}")]
    NotEnoughNodes {
        dc: String,
        requested: usize,
        available: usize,
    },

    /// No replica assignment satisfies rack uniqueness.
    #[error("rack constraint violation in datacenter {dc}")]
    RackConstraintViolation { dc: String },

    /// A topology-log append lost a race; recompute and retry with a fresh guard.
    #[error("concurrent topology modification")]
    ConcurrentModification,

    /// Streaming between replicas failed after all retries.
    #[error("streaming failed after {attempts} attempts: {reason}")]
    StreamingFailure { reason: String, attempts: usize },

    /// Read or write to the system catalog failed.
    #[error("catalog io error: {0}")]
    CatalogIo(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check whether the caller may retry locally (per the recovery rules:
    /// concurrent modification is retried with a fresh guard, streaming
    /// failures are retried by the transition driver before the read switch).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConcurrentModification | Error::StreamingFailure { .. }
        )
    }
}
