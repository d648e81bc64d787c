//! Error taxonomy for store operations.
//!
//! Query functions return [`StoreError`] so callers (and ultimately the HTTP
//! layer) can distinguish caller mistakes from state-machine violations and
//! from database trouble.

use std::time::Duration;

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Malformed input: bad identifiers, out-of-range numbers, unusable
    /// payloads. Maps to HTTP 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// The referenced task, worker, or conversation does not exist.
    /// Maps to HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is illegal for the row's current state (completing a
    /// non-running task, cancelling a terminal task, a worker touching a
    /// task it does not own). Maps to HTTP 409.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The database rejected the operation after transient-error retries
    /// were exhausted. Maps to HTTP 503.
    #[error("store error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Maximum retry attempts for transient database errors.
pub(crate) const MAX_DB_RETRIES: u32 = 3;

/// Base delay for exponential backoff between retries.
pub(crate) const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Whether a sqlx error is worth retrying: connection-level trouble or a
/// serialization/deadlock failure, not a constraint violation or bad query.
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => {
            // 40001 serialization_failure, 40P01 deadlock_detected,
            // 57P03 cannot_connect_now.
            matches!(db.code().as_deref(), Some("40001" | "40P01" | "57P03"))
        }
        _ => false,
    }
}

/// Whether a sqlx error is a unique-constraint violation (SQLSTATE 23505).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn row_not_found_is_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn display_includes_kind() {
        let err = StoreError::conflict("task is completed");
        assert!(err.to_string().contains("conflict"));
        let err = StoreError::not_found("no such worker");
        assert!(err.to_string().contains("not found"));
    }
}
