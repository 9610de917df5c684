//! Error types for the update engine.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the update engine, the journal and reclaim.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Log device error.
    #[error("storage error: {0}")]
    Storage(#[from] cowbtree_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transaction dropped its locks and must be retried by the caller.
    #[error("transaction interrupted, retry from the caller")]
    Interrupted,

    /// No space left for the update.
    #[error("no space left")]
    NoSpace,

    /// The store is read-only.
    #[error("store is read-only")]
    ReadOnly,

    /// The journal hit an error and stopped accepting writes.
    #[error("journal error: {message}")]
    JournalError {
        /// Description of the failure.
        message: String,
    },

    /// A journal entry could not be decoded.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch on a journal entry.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the entry.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// A node image could not be loaded.
    #[error("node corruption: {message}")]
    NodeCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },

    /// The store is shutting down.
    #[error("store is shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Creates a journal error.
    pub fn journal(message: impl Into<String>) -> Self {
        Self::JournalError {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a node corruption error.
    pub fn node_corruption(message: impl Into<String>) -> Self {
        Self::NodeCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for the transient restart signal.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            CoreError::journal_corruption("bad magic").to_string(),
            "journal corruption: bad magic"
        );
        assert_eq!(
            CoreError::ChecksumMismatch {
                expected: 0xdead_beef,
                actual: 0x1,
            }
            .to_string(),
            "checksum mismatch: expected deadbeef, got 00000001"
        );
    }

    #[test]
    fn interrupted_predicate() {
        assert!(CoreError::Interrupted.is_interrupted());
        assert!(!CoreError::NoSpace.is_interrupted());
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = cowbtree_storage::StorageError::ReadPastEnd {
            offset: 4,
            len: 1,
            size: 2,
        }
        .into();
        assert!(matches!(err, CoreError::Storage(_)));
    }
}
