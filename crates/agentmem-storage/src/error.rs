//! Error types for the storage layer.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors surfaced by the storage layer, discriminable by kind.
///
/// `Unavailable` is the only retryable class; everything else indicates a
/// caller-side problem or a damaged row and is never retried internally.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A required row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write referenced a missing or deleted parent row, or collided
    /// with an existing primary key.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A stored row could not be decoded.
    #[error("corrupted row: {0}")]
    Corrupted(String),

    /// The underlying database or index failed.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl StorageError {
    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

impl From<redb::DatabaseError> for StorageError {
    fn from(err: redb::DatabaseError) -> Self {
        StorageError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(err: redb::TransactionError) -> Self {
        StorageError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<redb::TableError> for StorageError {
    fn from(err: redb::TableError) -> Self {
        StorageError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(err: redb::StorageError) -> Self {
        StorageError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(err: redb::CommitError) -> Self {
        StorageError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<tantivy::TantivyError> for StorageError {
    fn from(err: tantivy::TantivyError) -> Self {
        StorageError::Unavailable(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Unavailable(anyhow::Error::new(err))
    }
}

/// Serialize a row for storage. Failures here mean a bug in the row types,
/// so they surface as `Unavailable` rather than `Corrupted`.
pub(crate) fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(row).map_err(|err| StorageError::Unavailable(err.into()))
}

/// Decode a stored row, tagging failures with what was being read.
pub(crate) fn decode_row<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|err| StorageError::Corrupted(format!("{what}: {err}")))
}
