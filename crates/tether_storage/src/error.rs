//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while executing SQL through an adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine rejected or failed a statement.
    #[error("sql error: {0}")]
    Sql(String),

    /// A constraint (unique, not null, foreign key) was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The database is locked by another connection.
    #[error("database busy")]
    Busy,

    /// The transaction body asked for a rollback.
    #[error("transaction aborted")]
    Aborted,

    /// A result column had an unexpected type or index.
    #[error("row decode error: {0}")]
    Decode(String),

    /// The adapter is closed.
    #[error("adapter is closed")]
    Closed,
}

impl StorageError {
    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Whether retrying the same transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy | StorageError::Io(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => {
                let text = message.clone().unwrap_or_else(|| failure.to_string());
                match failure.code {
                    rusqlite::ErrorCode::ConstraintViolation => StorageError::Constraint(text),
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                        StorageError::Busy
                    }
                    _ => StorageError::Sql(text),
                }
            }
            rusqlite::Error::InvalidColumnIndex(_)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::InvalidColumnName(_) => StorageError::Decode(err.to_string()),
            _ => StorageError::Sql(err.to_string()),
        }
    }
}
