//! Error types for the sync engine.

use crate::{OpToken, RecordId};
use thiserror::Error;

/// All possible errors from the sync engine.
///
/// Remote-store failures never appear here: they are absorbed by the
/// dispatcher's retry machinery. Callers only see local failures, which are
/// fatal to the calling mutation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("operation not found: {0}")]
    OperationNotFound(OpToken),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<crate::storage::StorageError> for Error {
    fn from(err: crate::storage::StorageError) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
