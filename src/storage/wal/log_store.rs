//! Append-only log file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, StorageError};
use crate::storage::wal::{LogHeader, FIRST_LSN, LOG_HEADER_SIZE};
use crate::storage::Lsn;

/// Writer for appending encoded frames to the log file.
///
/// Knows nothing about records or LSNs beyond the header's base LSN; the
/// WAL manager decides what bytes go in and when to sync.
pub struct LogStore {
    /// Path to the log file.
    path: PathBuf,
    /// Buffered writer for efficient I/O.
    writer: BufWriter<File>,
    /// Header as stored on disk.
    header: LogHeader,
    /// Logical length of the file, buffered bytes included.
    len: u64,
}

impl LogStore {
    /// Opens the log file, creating it with a fresh header if it is missing
    /// or too short to hold one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its header is invalid.
    pub fn open(path: &Path) -> Result<Self> {
        // A reset that never reached its rename left the old log in place.
        let stale = temp_path(path);
        if stale.exists() {
            std::fs::remove_file(&stale).map_err(|e| {
                StorageError::IoError(format!("Failed to remove stale WAL temp file: {e}"))
            })?;
            debug!(path = %stale.display(), "removed interrupted WAL reset");
        }

        let existing_len = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(StorageError::IoError(format!(
                    "Failed to get WAL metadata: {e}"
                )))
            }
        };
        if existing_len < LOG_HEADER_SIZE as u64 {
            // New file, or a crash before a fresh header was complete.
            install_header(path, &LogHeader::new(FIRST_LSN))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StorageError::IoError(format!("Failed to open WAL file: {e}")))?;

        let mut bytes = [0u8; LOG_HEADER_SIZE];
        file.read_exact(&mut bytes)
            .map_err(|e| StorageError::IoError(format!("Failed to read WAL header: {e}")))?;
        let header = LogHeader::decode(&bytes)?;

        let mut writer = BufWriter::new(file);
        let len = writer
            .seek(SeekFrom::End(0))
            .map_err(|e| StorageError::IoError(format!("Failed to seek WAL: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            header,
            len,
        })
    }

    /// Returns the path to the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the header.
    #[must_use]
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Returns the logical file length, including bytes not yet flushed.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns whether the file holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len <= LOG_HEADER_SIZE as u64
    }

    /// Appends already-encoded frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| StorageError::IoError(format!("Failed to write WAL frames: {e}")))?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    /// Flushes buffered writes to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| StorageError::IoError(format!("Failed to flush WAL: {e}")))
    }

    /// Flushes and syncs the log file to disk (fsync).
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.writer
            .get_ref()
            .sync_data()
            .map_err(|e| StorageError::IoError(format!("Failed to sync WAL: {e}")))
    }

    /// Cuts the file at `offset`, discarding everything after it.
    ///
    /// Used to drop a torn tail before new records are appended.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation fails or `offset` is inside the header.
    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        if offset < LOG_HEADER_SIZE as u64 {
            return Err(StorageError::WalError(format!(
                "cannot truncate WAL into its header (offset {offset})"
            )));
        }

        self.flush()?;
        self.writer
            .get_mut()
            .set_len(offset)
            .map_err(|e| StorageError::IoError(format!("Failed to truncate WAL: {e}")))?;
        self.writer
            .seek(SeekFrom::End(0))
            .map_err(|e| StorageError::IoError(format!("Failed to seek after truncate: {e}")))?;
        self.len = offset;
        self.sync()?;

        debug!(offset, "truncated WAL");
        Ok(())
    }

    /// Drops every frame and starts over with a new base LSN.
    ///
    /// # Errors
    ///
    /// Returns an error if the new log cannot be installed or reopened.
    pub fn reset(&mut self, base_lsn: Lsn) -> Result<()> {
        self.flush()?;

        let header = LogHeader::new(base_lsn);
        install_header(&self.path, &header)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| StorageError::IoError(format!("Failed to reopen WAL file: {e}")))?;
        file.seek(SeekFrom::End(0))
            .map_err(|e| StorageError::IoError(format!("Failed to seek after reset: {e}")))?;

        self.writer = BufWriter::new(file);
        self.header = header;
        self.len = LOG_HEADER_SIZE as u64;
        debug!(base_lsn, "reset WAL");
        Ok(())
    }
}

/// Replaces the file at `path` with one holding only `header`.
///
/// The header is written to a temporary file, synced, renamed over `path`,
/// and the directory synced, so a crash leaves either the old file or the
/// complete new one.
fn install_header(path: &Path, header: &LogHeader) -> Result<()> {
    let temp_path = temp_path(path);
    {
        let mut temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| StorageError::IoError(format!("Failed to create WAL temp file: {e}")))?;
        temp.write_all(&header.encode())
            .map_err(|e| StorageError::IoError(format!("Failed to write WAL header: {e}")))?;
        temp.sync_all()
            .map_err(|e| StorageError::IoError(format!("Failed to sync WAL temp file: {e}")))?;
    }

    std::fs::rename(&temp_path, path)
        .map_err(|e| StorageError::IoError(format!("Failed to replace WAL file: {e}")))?;
    sync_parent_dir(path)
}

/// Path of the file a header rewrite builds before renaming it over the log.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Makes a rename inside the log's directory durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::IoError(format!("Failed to sync WAL directory: {e}")))
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}
