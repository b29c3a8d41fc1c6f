//! Write-Ahead Logging (WAL) for crash recovery.
//!
//! This module implements a write-ahead log that ensures durability
//! and crash recovery for page updates.
//!
//! # Architecture
//!
//! The WAL consists of:
//! - A header with magic bytes, version and the base LSN
//! - Sequential log frames, each with its own CRC32
//! - Checkpoint records bounding how far back recovery must scan
//!
//! Appends go to an in-memory buffer under a short lock. A coordinator thread
//! turns flush requests into group commits: one write and one fsync per batch.

mod checkpointer;
mod log_store;
mod manager;
mod reader;
mod record;

pub use checkpointer::{CheckpointSummary, Checkpointer};
pub use log_store::LogStore;
pub use manager::{WalConfig, WalManager, WalStats};
pub use reader::{CorruptionDetails, LogReader, LogScan, LogTail};
pub use record::{
    ActiveTxnEntry, DirtyPageEntry, LogPayload, LogRecord, LogRecordType, FRAME_HEADER_SIZE,
    MAX_RECORD_SIZE,
};

use crate::error::{Result, StorageError};
use crate::storage::Lsn;

/// Magic bytes for WAL file identification.
pub const WAL_MAGIC: &[u8; 8] = b"RUZUWAL\0";

/// Current WAL format version.
pub const WAL_VERSION: u32 = 1;

/// Size of the encoded log header.
pub const LOG_HEADER_SIZE: usize = 8  // magic
    + 4  // version
    + 8  // base_lsn
    + 4; // crc32 of the above

/// First LSN of a brand-new log.
pub const FIRST_LSN: Lsn = 1;

/// WAL header stored at the beginning of the WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Magic bytes for file identification.
    pub magic: [u8; 8],
    /// WAL format version.
    pub version: u32,
    /// Lowest LSN any record in this file may carry. Survives truncation so
    /// LSNs never restart.
    pub base_lsn: Lsn,
}

impl LogHeader {
    /// Creates a new WAL header.
    #[must_use]
    pub fn new(base_lsn: Lsn) -> Self {
        Self {
            magic: *WAL_MAGIC,
            version: WAL_VERSION,
            base_lsn,
        }
    }

    /// Returns the serialized size of the header.
    #[must_use]
    pub const fn serialized_size() -> usize {
        LOG_HEADER_SIZE
    }

    /// Encodes the header, checksum included.
    #[must_use]
    pub fn encode(&self) -> [u8; LOG_HEADER_SIZE] {
        let mut buf = [0u8; LOG_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..20].copy_from_slice(&self.base_lsn.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..20]);
        buf[20..24].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLogFile` for a short buffer, bad magic or checksum, and
    /// `UnsupportedVersion` for a newer format.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::serialized_size() {
            return Err(StorageError::InvalidLogFile(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                Self::serialized_size()
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != *WAL_MAGIC {
            return Err(StorageError::InvalidLogFile("Invalid WAL magic bytes".into()));
        }

        let stored_crc = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        if stored_crc != crc32fast::hash(&bytes[0..20]) {
            return Err(StorageError::InvalidLogFile(
                "WAL header checksum mismatch".into(),
            ));
        }

        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version > WAL_VERSION {
            return Err(StorageError::UnsupportedVersion {
                version,
                max_supported: WAL_VERSION,
            });
        }

        let mut base_lsn = [0u8; 8];
        base_lsn.copy_from_slice(&bytes[12..20]);

        Ok(Self {
            magic,
            version,
            base_lsn: u64::from_le_bytes(base_lsn),
        })
    }
}
