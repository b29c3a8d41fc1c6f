//! Page-level storage primitives.
//!
//! This module defines the core page abstractions:
//! - `PageId`: Unique identifier for a page
//! - `Page`: Fixed-size data block (4KB) with an embedded page LSN
//! - `PageStore`: Flat file of page slots

mod page_id;
mod page_store;

pub use page_id::PageId;
pub use page_store::PageStore;

use crate::error::{Result, StorageError};
use crate::storage::Lsn;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Page header layout (16 bytes):
/// - Offset 0: `page_lsn` (u64)
/// - Offset 8: checksum (u32), CRC32 of every other byte of the page
/// - Offset 12: reserved (u32)
pub const PAGE_HEADER_SIZE: usize = 16;

/// Usable bytes after the header.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

const LSN_RANGE: std::ops::Range<usize> = 0..8;
const CHECKSUM_RANGE: std::ops::Range<usize> = 8..12;
const CHECKSUMMED_TAIL: usize = 12;

/// A fixed-size page of data.
#[derive(Clone)]
pub struct Page {
    /// Unique identifier for this page.
    pub id: PageId,
    /// Raw page data, header included.
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    /// Creates a new zeroed page with the given ID.
    #[must_use]
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Creates a page from existing data.
    #[must_use]
    pub fn from_data(id: PageId, data: [u8; PAGE_SIZE]) -> Self {
        Self { id, data }
    }

    /// Returns a read-only view of the page data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a mutable view of the page data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the LSN of the last log record reflected in this page.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[LSN_RANGE]);
        u64::from_le_bytes(buf)
    }

    /// Stamps the page with the LSN of the record that produced its current bytes.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        debug_assert!(
            lsn >= self.lsn(),
            "page LSN must not go backwards ({} -> {lsn})",
            self.lsn()
        );
        self.data[LSN_RANGE].copy_from_slice(&lsn.to_le_bytes());
    }

    /// Returns the payload area (everything after the header).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Validates that `[offset, offset + len)` lies inside the payload area.
    ///
    /// Offsets are absolute page offsets.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageWrite` if the range overlaps the header or runs past the page.
    pub fn check_range(offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if offset >= PAGE_HEADER_SIZE && end <= PAGE_SIZE => Ok(()),
            _ => Err(StorageError::InvalidPageWrite { offset, len }),
        }
    }

    /// Reads `len` bytes at an absolute page offset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageWrite` if the range is outside the payload.
    pub fn read_range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        Self::check_range(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Copies `bytes` into the page at an absolute page offset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageWrite` if the range is outside the payload.
    pub fn write_range(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        Self::check_range(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Computes the CRC32 checksum of the page, skipping the checksum field.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[LSN_RANGE]);
        hasher.update(&self.data[CHECKSUMMED_TAIL..]);
        hasher.finalize()
    }

    /// Writes the current checksum into the header.
    pub fn stamp_checksum(&mut self) {
        let checksum = self.checksum();
        self.data[CHECKSUM_RANGE].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Verifies the stored checksum. A never-written (all zero) page is valid.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[CHECKSUM_RANGE]);
        let stored = u32::from_le_bytes(buf);
        stored == self.checksum() || self.is_zeroed()
    }

    /// Returns whether every byte of the page is zero.
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("lsn", &self.lsn())
            .finish()
    }
}
