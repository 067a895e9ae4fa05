//! Storage error classification.
//!
//! Driver errors collapse into a small set of tagged kinds so callers can
//! branch on outcomes (duplicate start, lost version race, retryable blip)
//! without inspecting backend-specific codes.

use thiserror::Error;

// Postgres SQLSTATE classes treated as transient.
const SQLSTATE_QUERY_CANCELED: &str = "57014";
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
const SQLSTATE_TOO_MANY_CONNECTIONS: &str = "53300";
const SQLSTATE_INSUFFICIENT_RESOURCES_CLASS: &str = "53";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint hit, e.g. starting a process id that already has a
    /// latest-execution pointer.
    #[error("duplicate entry")]
    DuplicateEntry,

    #[error("row not found")]
    NotFound,

    /// The statement or connection timed out; safe to retry.
    #[error("storage timeout: {0}")]
    Timeout(sqlx::Error),

    /// The backend is shedding load; safe to retry after backoff.
    #[error("storage throttled: {0}")]
    Throttling(sqlx::Error),

    /// A versioned update affected zero rows: a concurrent writer won.
    #[error("conditional update failed: lost the version race")]
    ConditionalUpdateFailure,

    /// The durable model no longer agrees with itself.
    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_duplicate_entry(&self) -> bool {
        matches!(self, StoreError::DuplicateEntry)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_conditional_update_failure(&self) -> bool {
        matches!(self, StoreError::ConditionalUpdateFailure)
    }

    /// Transient kinds the task loop may retry locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Throttling(_))
    }
}

enum ErrorKind {
    Duplicate,
    NotFound,
    Timeout,
    Throttling,
    Other,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            sqlx::Error::PoolTimedOut => ErrorKind::Timeout,
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    ErrorKind::Duplicate
                } else {
                    match db.code().as_deref() {
                        Some(SQLSTATE_QUERY_CANCELED) => ErrorKind::Timeout,
                        Some(SQLSTATE_LOCK_NOT_AVAILABLE)
                        | Some(SQLSTATE_TOO_MANY_CONNECTIONS) => ErrorKind::Throttling,
                        Some(code) if code.starts_with(SQLSTATE_INSUFFICIENT_RESOURCES_CLASS) => {
                            ErrorKind::Throttling
                        }
                        _ => ErrorKind::Other,
                    }
                }
            }
            _ => ErrorKind::Other,
        };
        match kind {
            ErrorKind::Duplicate => StoreError::DuplicateEntry,
            ErrorKind::NotFound => StoreError::NotFound,
            ErrorKind::Timeout => StoreError::Timeout(err),
            ErrorKind::Throttling => StoreError::Throttling(err),
            ErrorKind::Other => StoreError::Database(err),
        }
    }
}
