use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("No row with the given identifier exists: {0}")]
    NotFound(String),

    #[error("Invalid entity state: {0}")]
    InvalidState(String),

    /// A different instance with the same identity is already tracked.
    #[error("Non-unique object: {0}")]
    Conflict(String),

    /// The stored row was changed or removed by another unit of work.
    #[error("Row was updated or deleted by another transaction: {0}")]
    StaleState(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Lock wait timed out after {timeout_ms}ms on {key}")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("Lock on {0} is held by another session")]
    LockUnavailable(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Session factory is closed")]
    FactoryClosed,

    /// Raised only on paths that correct callers never reach. Not retryable.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PersistError {
    /// Lock acquisition failures are the only errors a caller may sensibly retry.
    pub fn is_lock_failure(&self) -> bool {
        matches!(
            self,
            PersistError::LockTimeout { .. } | PersistError::LockUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
