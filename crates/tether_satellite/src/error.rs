//! Error types for the satellite.

use std::io;
use tether_codec::CodecError;
use tether_protocol::{ProtocolError, TransactionId};
use tether_storage::StorageError;
use thiserror::Error;

/// Result type for satellite operations.
pub type SatelliteResult<T> = Result<T, SatelliteError>;

/// Errors surfaced by the replication engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SatelliteError {
    /// Migration bundle or history is inconsistent (gap, reorder, checksum mismatch).
    #[error("schema integrity violation: {0}")]
    SchemaIntegrity(String),

    /// A migration needs a newer protocol than this client speaks.
    #[error("migration {version} requires protocol {required}, client speaks {supported}")]
    IncompatibleSchema {
        /// Offending migration.
        version: u32,
        /// Protocol version the migration requires.
        required: u16,
        /// Protocol version of this client.
        supported: u16,
    },

    /// The server expects a newer schema than the local database has.
    #[error("local schema {local} is behind server schema {server}")]
    NeedsMigration {
        /// Local schema version.
        local: u32,
        /// Schema version reported by the server.
        server: u32,
    },

    /// Authentication was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Client and server cannot agree on a protocol version.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// An inbound transaction could not be applied locally.
    #[error("failed to apply transaction {transaction_id} after {attempts} attempts: {message}")]
    ApplyFailure {
        /// The transaction that failed.
        transaction_id: TransactionId,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// Execution adapter error.
    #[error("storage error: {message}")]
    Storage {
        /// Error message.
        message: String,
        /// Whether retrying the same transaction may succeed.
        transient: bool,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(String),

    /// Protocol error (unexpected or malformed message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A satellite is already running under this name.
    #[error("satellite already running for database {0:?}")]
    AlreadyRunning(String),

    /// No satellite is running under this name.
    #[error("no satellite running for database {0:?}")]
    NotRunning(String),

    /// The satellite has been stopped.
    #[error("satellite stopped")]
    Stopped,

    /// Operation timed out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SatelliteError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a schema integrity error.
    pub fn schema_integrity(message: impl Into<String>) -> Self {
        Self::SchemaIntegrity(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SatelliteError::Transport { retryable, .. } => *retryable,
            SatelliteError::Storage { transient, .. } => *transient,
            SatelliteError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error ends the satellite's session for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SatelliteError::SchemaIntegrity(_)
                | SatelliteError::IncompatibleSchema { .. }
                | SatelliteError::NeedsMigration { .. }
                | SatelliteError::Auth(_)
                | SatelliteError::ProtocolMismatch(_)
                | SatelliteError::ApplyFailure { .. }
        )
    }
}

impl From<StorageError> for SatelliteError {
    fn from(err: StorageError) -> Self {
        Self::Storage {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl From<CodecError> for SatelliteError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<ProtocolError> for SatelliteError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Codec(codec) => Self::Codec(codec.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<io::Error> for SatelliteError {
    fn from(err: io::Error) -> Self {
        Self::transport_retryable(err.to_string())
    }
}
