//! Error types for pool operations

use std::time::Duration;

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Raised only under fail-fast admission.
    #[error("pool exhausted for {operation} (next available at {next_available_at:?})")]
    PoolExhausted {
        operation: String,
        next_available_at: Option<i64>,
    },

    #[error("no identity for {operation} after waiting {waited:?}")]
    AcquireTimeout { operation: String, waited: Duration },

    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("lease on {0} was lost")]
    LeaseLost(String),

    #[error("refresh failed for {handle}: {reason}")]
    RefreshFailed { handle: String, reason: String },

    #[error("no refresh trigger installed")]
    NoRefreshTrigger,

    #[error("import failed on line {line}: {reason}")]
    Import { line: usize, reason: String },

    #[error("release task failed: {0}")]
    ReleaseTask(String),

    #[error("store error: {0}")]
    Store(#[from] lease_store::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
