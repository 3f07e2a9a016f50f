use thiserror::Error;

use crate::errors::GitError;

/// Failure of a registry or storage-handle operation.
///
/// Variants are the categories transports map to status codes; the payload is a short message
/// naming the repository, object or reference involved.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Repository, object, reference or config record is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Creating something that is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed name or argument supplied by the caller.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Compare-and-swap found a different current value.
    #[error("reference conflict on {name}: expected {expected}, found {actual}")]
    ReferenceConflict {
        name: String,
        expected: String,
        actual: String,
    },

    /// The medium failed or returned data that does not decode.
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        StorageError::NotFound(what.to_string())
    }

    pub fn backend(msg: impl std::fmt::Display) -> Self {
        StorageError::Backend(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<GitError> for StorageError {
    fn from(err: GitError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
