//! Log reader: sequential scan with tail classification.
//!
//! A scan walks frames from the header to the first frame that does not
//! verify, then decides whether that is a torn tail (crash mid-append, safe
//! to discard) or corruption in the middle of the log (fatal).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::storage::wal::record::{FRAME_HEADER_SIZE, MAX_RECORD_SIZE};
use crate::storage::wal::{LogHeader, LogRecord, FIRST_LSN, LOG_HEADER_SIZE};
use crate::storage::{Lsn, INVALID_LSN};

/// Where and why the log stopped being trustworthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionDetails {
    /// Byte offset of the offending frame.
    pub offset: u64,
    /// Human-readable reason.
    pub reason: String,
}

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTail {
    /// Every byte after the header belongs to a verified frame.
    Clean,
    /// A partially written trailing frame. Everything from `offset` on is
    /// discarded.
    Torn {
        /// Offset of the first discarded byte.
        offset: u64,
        /// Number of discarded bytes.
        discarded_bytes: u64,
        /// Why the trailing frame was rejected.
        reason: String,
    },
    /// Damage that a crash during append cannot explain.
    Corrupt(CorruptionDetails),
}

/// Result of scanning a log file.
#[derive(Debug, Clone)]
pub struct LogScan {
    /// File header.
    pub header: LogHeader,
    /// Verified records in LSN order.
    pub records: Vec<LogRecord>,
    /// Offset just past the last verified frame.
    pub valid_end: u64,
    /// How the scan ended.
    pub tail: LogTail,
}

impl LogScan {
    /// Returns the LSN of the last verified record, or `INVALID_LSN`.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.records.last().map_or(INVALID_LSN, |r| r.lsn)
    }

    /// Returns the LSN the next append must use.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        (self.last_lsn() + 1).max(self.header.base_lsn)
    }

    /// Returns whether the scan hit mid-log corruption.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self.tail, LogTail::Corrupt(_))
    }
}

/// Result of parsing one frame.
enum Frame {
    /// Verified frame; `body` is the record bytes.
    Valid { body: std::ops::Range<usize>, next: usize },
    /// Checksum did not match; `next` is where the following frame would start.
    BadChecksum { next: usize },
    /// Frame cannot be complete.
    Incomplete(&'static str),
}

/// Reader for log files.
pub struct LogReader {
    /// Path to the log file.
    path: PathBuf,
}

impl LogReader {
    /// Creates a reader for the log at `path`.
    #[must_use]
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Returns the path to the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and verifies every record.
    ///
    /// A missing file scans as an empty log.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its header is invalid.
    /// Damaged frames are reported through [`LogScan::tail`], not as errors.
    pub fn scan(&self) -> Result<LogScan> {
        let bytes = match File::open(&self.path) {
            Ok(file) => {
                let mut bytes = Vec::new();
                BufReader::new(file)
                    .read_to_end(&mut bytes)
                    .map_err(|e| StorageError::IoError(format!("Failed to read WAL file: {e}")))?;
                bytes
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(StorageError::IoError(format!(
                    "Failed to open WAL file: {e}"
                )))
            }
        };

        if bytes.len() < LOG_HEADER_SIZE {
            return Ok(LogScan {
                header: LogHeader::new(FIRST_LSN),
                records: Vec::new(),
                valid_end: LOG_HEADER_SIZE as u64,
                tail: LogTail::Clean,
            });
        }

        let header = LogHeader::decode(&bytes[..LOG_HEADER_SIZE])?;
        let scan = scan_frames(&bytes, header);
        debug!(
            records = scan.records.len(),
            valid_end = scan.valid_end,
            tail = ?scan.tail,
            "scanned WAL"
        );
        Ok(scan)
    }
}

fn scan_frames(bytes: &[u8], header: LogHeader) -> LogScan {
    let mut records: Vec<LogRecord> = Vec::new();
    let mut pos = LOG_HEADER_SIZE;

    let tail = loop {
        if pos == bytes.len() {
            break LogTail::Clean;
        }

        match parse_frame(bytes, pos) {
            Frame::Valid { body, next } => {
                let record = match LogRecord::deserialize(&bytes[body]) {
                    Ok(record) => record,
                    Err(e) => {
                        break LogTail::Corrupt(CorruptionDetails {
                            offset: pos as u64,
                            reason: format!("verified frame does not decode: {e}"),
                        })
                    }
                };

                let floor = records.last().map_or(header.base_lsn, |r| r.lsn + 1);
                if record.lsn < floor {
                    break LogTail::Corrupt(CorruptionDetails {
                        offset: pos as u64,
                        reason: format!("LSN {} does not follow {}", record.lsn, floor - 1),
                    });
                }

                records.push(record);
                pos = next;
            }
            Frame::BadChecksum { next } => {
                if matches!(parse_frame(bytes, next), Frame::Valid { .. }) {
                    break LogTail::Corrupt(CorruptionDetails {
                        offset: pos as u64,
                        reason: "checksum mismatch followed by a valid frame".into(),
                    });
                }
                break torn(bytes, pos, "checksum mismatch in trailing frame");
            }
            Frame::Incomplete(reason) => break torn(bytes, pos, reason),
        }
    };

    if let LogTail::Torn {
        offset,
        discarded_bytes,
        reason,
    } = &tail
    {
        warn!(offset, discarded_bytes, reason = %reason, "WAL has a torn tail");
    }

    LogScan {
        header,
        records,
        valid_end: pos as u64,
        tail,
    }
}

fn torn(bytes: &[u8], pos: usize, reason: &str) -> LogTail {
    LogTail::Torn {
        offset: pos as u64,
        discarded_bytes: (bytes.len() - pos) as u64,
        reason: reason.to_string(),
    }
}

fn parse_frame(bytes: &[u8], pos: usize) -> Frame {
    let Some(remaining) = bytes.len().checked_sub(pos) else {
        return Frame::Incomplete("frame starts past end of file");
    };
    if remaining < FRAME_HEADER_SIZE {
        return Frame::Incomplete("truncated frame header");
    }

    let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
        as usize;
    let crc = u32::from_le_bytes([
        bytes[pos + 4],
        bytes[pos + 5],
        bytes[pos + 6],
        bytes[pos + 7],
    ]);

    if len == 0 {
        return Frame::Incomplete("zero-length frame");
    }
    if len > MAX_RECORD_SIZE {
        return Frame::Incomplete("impossible frame length");
    }
    if remaining - FRAME_HEADER_SIZE < len {
        return Frame::Incomplete("truncated frame body");
    }

    let start = pos + FRAME_HEADER_SIZE;
    let end = start + len;
    if crc32fast::hash(&bytes[start..end]) != crc {
        return Frame::BadChecksum { next: end };
    }

    Frame::Valid {
        body: start..end,
        next: end,
    }
}
