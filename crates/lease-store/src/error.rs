//! Error types for lease store operations

/// Errors from lease store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("migration to v{version} failed: {reason}")]
    Migration { version: i64, reason: String },

    #[error("invalid operation name: {0}")]
    InvalidOperation(String),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Contention from another process that outlasted the retry budget.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy { .. })
    }
}

/// Result alias for lease store operations.
pub type Result<T> = std::result::Result<T, Error>;
