//! Storage core for ruzu.
//!
//! This module provides the durable storage layer:
//! - Page-level I/O ([`page`])
//! - Buffer pool management ([`buffer_pool`])
//! - Write-ahead logging with group commit ([`wal`])
//! - ARIES-style crash recovery ([`recovery`])

pub mod buffer_pool;
pub mod page;
pub mod recovery;
pub mod wal;

// Re-export commonly used types
pub use buffer_pool::{
    BackgroundFlusher, BufferPool, BufferPoolStats, FrameRef, LogFlush, PageHandle,
    PageWriteGuard,
};
pub use page::{Page, PageId, PageStore, PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE, PAGE_SIZE};
pub use recovery::{DataLoss, RecoveryManager, RecoveryOutcome, RecoveryReport};
pub use wal::{
    ActiveTxnEntry, CheckpointSummary, Checkpointer, CorruptionDetails, DirtyPageEntry,
    LogHeader, LogPayload, LogReader, LogRecord, LogRecordType, LogScan, LogStore, LogTail,
    WalConfig, WalManager, WalStats,
};

/// Log sequence number. Strictly increasing across the whole log, never reused.
pub type Lsn = u64;

/// Transaction identifier.
pub type TxnId = u64;

/// LSN value that no record ever carries; marks "no previous record".
pub const INVALID_LSN: Lsn = 0;

/// File name of the data file inside the database directory.
pub const DATA_FILE_NAME: &str = "data.ruzu";

/// File name of the log file inside the database directory.
pub const WAL_FILE_NAME: &str = "wal.log";
