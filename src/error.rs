//! Error types for the resharding donor.

use crate::types::{Namespace, OperationId, ShardId};
use std::io;
use thiserror::Error;

/// Result type alias for donor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resharding donor.
#[derive(Error, Debug)]
pub enum Error {
    /// Intake or signal validation failed. Never becomes a donor phase.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage layer errors.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// This node lost leadership while the operation was running.
    ///
    /// The persisted record survives and the operation resumes on the next
    /// step-up.
    #[error("interrupted due to leadership change")]
    Interrupted,

    /// A lifecycle call was made while this node does not own donor state.
    #[error("node is not primary")]
    NotPrimary,

    /// Unrecoverable persistence or namespace invariant violation.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Error reported by the external coordinator bridge.
    #[error("external state error: {0}")]
    External(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a step should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Transient(_)) | Error::External(_))
    }

    /// Whether this is a leadership-loss interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

/// Intake and signal validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The participant set lists the same shard more than once.
    #[error("participant {0} appears more than once")]
    DuplicateParticipant(ShardId),

    /// The participant set is empty.
    #[error("participant set is empty")]
    EmptyParticipantSet,

    /// A record with this operation id already exists.
    #[error("operation {0} already exists")]
    DuplicateOperation(OperationId),

    /// No donor is registered for the operation.
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    /// A coordinator signal contradicts what the donor already committed to.
    #[error("signal {signal} for operation {operation_id} out of order: requires {requires}")]
    SignalOutOfOrder {
        operation_id: OperationId,
        signal: &'static str,
        requires: &'static str,
    },

    /// A namespace string could not be parsed.
    #[error("malformed namespace: {0:?}")]
    MalformedNamespace(String),
}

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Retryable write conflict or temporary unavailability.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Record not found.
    #[error("record not found: {0}")]
    RecordNotFound(OperationId),

    /// Collection expected by the unit of work is missing.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(Namespace),

    /// Collection exists but with a different uuid than the unit expected.
    #[error("namespace {ns} has uuid {actual}, expected {expected}")]
    UuidMismatch {
        ns: Namespace,
        expected: uuid::Uuid,
        actual: uuid::Uuid,
    },

    /// On-disk snapshot failed verification.
    #[error("corrupted snapshot: {0}")]
    Corrupted(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(StorageError::Serialization(e.to_string()))
    }
}
