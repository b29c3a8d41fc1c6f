//! Log record types and frame serialization.
//!
//! On disk every record is a frame: `len u32 | crc32(body) u32 | body`,
//! where the body is the bincode encoding of a [`LogRecord`].

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::storage::page::{Page, PageId};
use crate::storage::{Lsn, TxnId};

/// Size of the per-frame prefix (length + checksum).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest body a frame may carry; anything larger is treated as garbage.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Type of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
    /// Begin a new transaction.
    Begin,
    /// Commit a transaction.
    Commit,
    /// Abort a transaction (fully undone).
    Abort,
    /// Physical update of a page byte range.
    Update,
    /// Compensation record written while undoing an update.
    Compensation,
    /// Checkpoint marker.
    Checkpoint,
}

/// A dirty page and the LSN of the first update not yet on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyPageEntry {
    /// Dirty page.
    pub page_id: PageId,
    /// Earliest LSN whose effect may be missing from the stored page.
    pub rec_lsn: Lsn,
}

/// A transaction that was running when a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTxnEntry {
    /// Transaction ID.
    pub txn_id: TxnId,
    /// LSN of its most recent record.
    pub last_lsn: Lsn,
}

/// Payload for a log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    /// Begin transaction payload.
    Begin,
    /// Page update payload.
    Update {
        /// Page being modified.
        page_id: PageId,
        /// Absolute byte offset within the page.
        offset: u32,
        /// Bytes before the update.
        before: Vec<u8>,
        /// Bytes after the update.
        after: Vec<u8>,
    },
    /// Commit transaction payload.
    Commit,
    /// Abort transaction payload.
    Abort,
    /// Checkpoint payload.
    Checkpoint {
        /// Log position when the dirty-page snapshot started. Updates at or
        /// after it may be missing from `dirty_pages`.
        redo_lsn: Lsn,
        /// Dirty pages at checkpoint time.
        dirty_pages: Vec<DirtyPageEntry>,
        /// Transactions still running at checkpoint time.
        active_txns: Vec<ActiveTxnEntry>,
    },
    /// Compensation (CLR) payload. Redo-only; never undone itself.
    Compensation {
        /// Page being restored.
        page_id: PageId,
        /// Absolute byte offset within the page.
        offset: u32,
        /// Restored bytes (the undone update's before-image).
        image: Vec<u8>,
        /// Next record of the transaction still to undo.
        undo_next_lsn: Lsn,
    },
}

impl LogPayload {
    /// Builds an update payload, validating the images against the page layout.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageWrite` if the images differ in length or the range
    /// falls outside the page payload.
    pub fn update(page_id: PageId, offset: usize, before: Vec<u8>, after: Vec<u8>) -> Result<Self> {
        if before.len() != after.len() {
            return Err(StorageError::InvalidPageWrite {
                offset,
                len: after.len(),
            });
        }
        Page::check_range(offset, after.len())?;
        Ok(LogPayload::Update {
            page_id,
            offset: offset as u32,
            before,
            after,
        })
    }

    /// Returns the record type of this payload.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        match self {
            LogPayload::Begin => LogRecordType::Begin,
            LogPayload::Update { .. } => LogRecordType::Update,
            LogPayload::Commit => LogRecordType::Commit,
            LogPayload::Abort => LogRecordType::Abort,
            LogPayload::Checkpoint { .. } => LogRecordType::Checkpoint,
            LogPayload::Compensation { .. } => LogRecordType::Compensation,
        }
    }

    /// Returns whether this record ends its transaction.
    #[must_use]
    pub fn ends_transaction(&self) -> bool {
        matches!(self, LogPayload::Commit | LogPayload::Abort)
    }

    /// Returns the page, offset and bytes this record writes when redone.
    #[must_use]
    pub fn redo_image(&self) -> Option<(PageId, usize, &[u8])> {
        match self {
            LogPayload::Update {
                page_id,
                offset,
                after,
                ..
            } => Some((*page_id, *offset as usize, after.as_slice())),
            LogPayload::Compensation {
                page_id,
                offset,
                image,
                ..
            } => Some((*page_id, *offset as usize, image.as_slice())),
            _ => None,
        }
    }
}

/// A single log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log Sequence Number (strictly increasing).
    pub lsn: Lsn,
    /// Transaction that owns this record (0 for checkpoints).
    pub txn_id: TxnId,
    /// Previous record of the same transaction, 0 if none.
    pub prev_lsn: Lsn,
    /// Record payload.
    pub payload: LogPayload,
}

impl LogRecord {
    /// Creates a new log record.
    #[must_use]
    pub fn new(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    /// Returns the type of this record.
    #[must_use]
    pub fn record_type(&self) -> LogRecordType {
        self.payload.record_type()
    }

    /// Serializes the record body.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| {
            StorageError::SerializationError(format!("Failed to serialize log record: {e}"))
        })
    }

    /// Deserializes a record body.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| {
            StorageError::SerializationError(format!("Failed to deserialize log record: {e}"))
        })
    }

    /// Serializes the record as a complete on-disk frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the body is too large.
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = self.serialize()?;
        if body.len() > MAX_RECORD_SIZE {
            return Err(StorageError::SerializationError(format!(
                "log record of {} bytes exceeds the {MAX_RECORD_SIZE} byte limit",
                body.len()
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}
