//! Error types for ruzu storage operations.

use thiserror::Error;

use crate::storage::page::PageId;
use crate::storage::Lsn;

/// Result type alias using [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types for the page store, buffer pool, WAL and recovery.
#[derive(Debug, Error)]
pub enum StorageError {
    // ==================== Buffer Pool ====================
    /// Every frame is pinned; the caller may retry or abort.
    #[error("Buffer pool exhausted: all {capacity} frames are pinned")]
    PoolExhausted { capacity: usize },

    /// Unpin of a page whose pin count is already zero (caller protocol violation).
    #[error("Page {0} is not pinned")]
    NotPinned(PageId),

    /// A dirty page was about to be written before its log records were durable.
    #[error("Write-ahead violation: {page_id} has page LSN {page_lsn} but log is durable only up to {durable_lsn}")]
    WriteAheadViolation {
        page_id: PageId,
        page_lsn: Lsn,
        durable_lsn: Lsn,
    },

    // ==================== Page Store ====================
    /// Page ID outside the allocated range.
    #[error("Invalid page ID: {page_id} (allocated pages: {num_pages})")]
    InvalidPageId { page_id: PageId, num_pages: u32 },

    /// The backing file cannot grow.
    #[error("Out of space: {0}")]
    OutOfSpace(String),

    /// A byte range that does not fit in the page payload.
    #[error("Invalid page write at offset {offset} with length {len}")]
    InvalidPageWrite { offset: usize, len: usize },

    /// Stored page failed checksum verification.
    #[error("Page checksum mismatch on {0}")]
    PageChecksumMismatch(PageId),

    /// Device-level I/O failure.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Writes refused after repeated I/O failures or a failed log sync.
    #[error("Storage is read-only: {0}")]
    ReadOnly(String),

    // ==================== Write-Ahead Log ====================
    /// WAL (Write-Ahead Log) errors.
    #[error("WAL error: {0}")]
    WalError(String),

    /// Previously verified log data is damaged.
    #[error("Corrupted log: {0}")]
    CorruptedLog(String),

    /// Invalid log magic bytes or header.
    #[error("Invalid log file: {0}")]
    InvalidLogFile(String),

    /// Unsupported log version.
    #[error("Unsupported log version: {version} (max supported: {max_supported})")]
    UnsupportedVersion { version: u32, max_supported: u32 },

    /// Record serialization failures.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // ==================== Recovery / Engine ====================
    /// Recovery found corruption and the engine refuses to come online.
    #[error("Fatal corruption at log offset {offset}: {reason}")]
    FatalCorruption { offset: u64, reason: String },

    /// Unknown or finished transaction.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    /// Returns whether the caller can reasonably retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::PoolExhausted { .. })
    }

    /// Returns whether the error signals damaged persistent state.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::CorruptedLog(_)
                | StorageError::FatalCorruption { .. }
                | StorageError::PageChecksumMismatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_display() {
        let err = StorageError::PoolExhausted { capacity: 2 };
        assert!(err.to_string().contains("2 frames"));
        assert!(err.is_retryable());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_not_pinned_display() {
        let err = StorageError::NotPinned(PageId::new(7));
        assert!(err.to_string().contains("Page(7)"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_corruption_classification() {
        assert!(StorageError::CorruptedLog("bad".into()).is_corruption());
        assert!(StorageError::FatalCorruption {
            offset: 10,
            reason: "bad".into()
        }
        .is_corruption());
        assert!(!StorageError::IoError("disk".into()).is_corruption());
    }
}
