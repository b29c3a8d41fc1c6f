//! Page store: the flat data file of fixed-size page slots.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};
use crate::storage::page::{Page, PageId, PAGE_SIZE};

/// Reads, writes and allocates pages in a single data file.
///
/// Page `i` lives at byte offset `i * PAGE_SIZE`. There is no caching and no
/// concurrency control here; the buffer pool serializes access.
pub struct PageStore {
    /// Path to the data file.
    path: PathBuf,
    /// File handle for the data file.
    file: File,
    /// Number of allocated page slots.
    num_pages: u32,
    /// Optional upper bound on the number of pages.
    max_pages: Option<u32>,
}

impl PageStore {
    /// Opens or creates a data file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::IoError(format!("Failed to open data file: {e}")))?;

        let file_len = file
            .metadata()
            .map_err(|e| StorageError::IoError(format!("Failed to get file metadata: {e}")))?
            .len();

        // A partially extended trailing slot still counts as allocated.
        let num_pages = file_len.div_ceil(PAGE_SIZE as u64) as u32;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            num_pages,
            max_pages: None,
        })
    }

    /// Limits how many pages the store may hold.
    #[must_use]
    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Returns the path to the data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of allocated pages.
    #[must_use]
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    fn check_id(&self, page_id: PageId) -> Result<()> {
        if page_id.index() >= self.num_pages {
            return Err(StorageError::InvalidPageId {
                page_id,
                num_pages: self.num_pages,
            });
        }
        Ok(())
    }

    /// Reads a page from disk.
    ///
    /// Bytes past the end of a short trailing slot read as zero.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageId` for unallocated pages, `IoError` on read failure
    /// and `PageChecksumMismatch` if the stored checksum does not verify.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        self.check_id(page_id)?;

        self.file
            .seek(SeekFrom::Start(page_id.offset()))
            .map_err(|e| StorageError::IoError(format!("Failed to seek to {page_id}: {e}")))?;

        let mut data = [0u8; PAGE_SIZE];
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match self.file.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(StorageError::IoError(format!(
                        "Failed to read {page_id}: {e}"
                    )))
                }
            }
        }

        let page = Page::from_data(page_id, data);
        if !page.verify_checksum() {
            return Err(StorageError::PageChecksumMismatch(page_id));
        }
        Ok(page)
    }

    /// Writes a page to disk, stamping its checksum first.
    ///
    /// When `sync` is set the call returns only after the data is durable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageId` for unallocated pages and `IoError` if the write fails.
    pub fn write_page(&mut self, page: &Page, sync: bool) -> Result<()> {
        self.check_id(page.id)?;

        let mut stamped = page.clone();
        stamped.stamp_checksum();

        self.file
            .seek(SeekFrom::Start(page.id.offset()))
            .map_err(|e| StorageError::IoError(format!("Failed to seek to {}: {e}", page.id)))?;

        self.file
            .write_all(&stamped.data)
            .map_err(|e| StorageError::IoError(format!("Failed to write {}: {e}", page.id)))?;

        if sync {
            self.sync()?;
        }

        Ok(())
    }

    /// Allocates a new page at the end of the file and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if the page limit is reached or the file cannot grow.
    pub fn allocate(&mut self) -> Result<PageId> {
        let page_idx = self.num_pages;
        if page_idx == u32::MAX || self.max_pages.is_some_and(|max| page_idx >= max) {
            return Err(StorageError::OutOfSpace(format!(
                "page limit reached at {page_idx} pages"
            )));
        }

        self.grow_to(page_idx + 1)?;
        Ok(PageId::new(page_idx))
    }

    /// Grows the file so that `page_id` is allocated. No-op if it already is.
    ///
    /// Used by recovery when a page allocation did not reach the disk before a crash.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if the file cannot grow.
    pub fn ensure_allocated(&mut self, page_id: PageId) -> Result<()> {
        if page_id.index() < self.num_pages {
            return Ok(());
        }
        self.grow_to(page_id.index() + 1)
    }

    fn grow_to(&mut self, num_pages: u32) -> Result<()> {
        let new_size = u64::from(num_pages) * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .map_err(|e| StorageError::OutOfSpace(format!("Failed to extend data file: {e}")))?;
        self.num_pages = num_pages;
        Ok(())
    }

    /// Flushes all written pages to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| StorageError::IoError(format!("Failed to sync data file: {e}")))
    }

    /// Returns the size of the data file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn file_size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| StorageError::IoError(format!("Failed to get file size: {e}")))
    }
}
