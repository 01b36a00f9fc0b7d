//! Error types for the memory subsystem.

use agentmem_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the memory subsystem, discriminable by kind.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed input, rejected before any write reaches storage.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The named entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A write referenced a missing or deleted parent.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Storage or index failure. The only retryable kind; retrying is the
    /// caller's decision, nothing here retries internally.
    #[error("Storage unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// The protected floor alone exceeds the context budget. A
    /// configuration error: protected content is never auto-truncated.
    #[error("Protected context ({protected_tokens} tokens) exceeds the budget ({budget_tokens} tokens)")]
    ContextOverflow {
        protected_tokens: usize,
        budget_tokens: usize,
    },
}

impl MemoryError {
    /// Whether the caller may reasonably retry the failed call as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::Unavailable(_))
    }
}

impl From<StorageError> for MemoryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => MemoryError::NotFound(what),
            StorageError::Integrity(what) => MemoryError::Integrity(what),
            StorageError::Unavailable(source) => MemoryError::Unavailable(source),
            corrupted @ StorageError::Corrupted(_) => {
                MemoryError::Unavailable(anyhow::Error::new(corrupted))
            }
        }
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        MemoryError::Unavailable(anyhow::Error::new(err))
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
