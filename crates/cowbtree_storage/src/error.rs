//! Errors raised by log devices.

use std::io;
use thiserror::Error;

/// Result type for log device operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a [`crate::StorageBackend`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the device.
    #[error("read beyond end of device: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current device size.
        size: u64,
    },

    /// Attempted to grow the device through `truncate`.
    #[error("cannot truncate device of size {size} to {requested}")]
    TruncateBeyondEnd {
        /// The requested size.
        requested: u64,
        /// The current device size.
        size: u64,
    },
}
