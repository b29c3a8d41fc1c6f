//! ruzu storage core.
//!
//! Durable page storage for the ruzu graph database: a fixed-size buffer
//! pool over a single data file, a write-ahead log with group commit, and
//! ARIES-style crash recovery. [`StorageEngine`] ties them together.
//!
//! # Example
//!
//! ```no_run
//! use ruzu_storage::{EngineConfig, StorageEngine, PAGE_HEADER_SIZE};
//!
//! # fn main() -> ruzu_storage::Result<()> {
//! let engine = StorageEngine::open(std::path::Path::new("./db"), EngineConfig::default())?;
//! let page_id = engine.allocate_page()?;
//!
//! let txn = engine.begin()?;
//! engine.write(txn, page_id, PAGE_HEADER_SIZE, b"hello")?;
//! engine.commit(txn)?;
//!
//! assert_eq!(engine.read(page_id, PAGE_HEADER_SIZE, 5)?, b"hello");
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod storage;
mod transaction;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

pub use error::{Result, StorageError};
pub use storage::{
    BackgroundFlusher, BufferPool, BufferPoolStats, CheckpointSummary, DataLoss, LogPayload,
    Lsn, Page, PageId, RecoveryOutcome, RecoveryReport, TxnId, WalConfig, WalManager, WalStats,
    INVALID_LSN, PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE, PAGE_SIZE,
};

use storage::{
    Checkpointer, LogReader, LogStore, LogTail, PageStore, RecoveryManager, DATA_FILE_NAME,
    WAL_FILE_NAME,
};
use transaction::{TransactionTable, UndoEntry};

/// Configuration for opening a storage engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the buffer pool in bytes (default: 16MB).
    pub buffer_pool_size: usize,
    /// Period of the background page flusher; `None` disables it (default: 1s).
    pub flush_interval: Option<Duration>,
    /// How long the WAL waits to batch flush requests (default: 2ms).
    pub group_commit_window: Duration,
    /// Buffered log bytes that end the batching window early (default: 1MB).
    pub max_batch_bytes: usize,
    /// Upper bound on a single durability wait (default: 30s).
    pub flush_timeout: Duration,
    /// Fsync every page write (default: false).
    pub sync_page_writes: bool,
    /// Maximum number of pages in the data file (default: unlimited).
    pub max_pages: Option<u32>,
    /// Consecutive page-write failures before the pool turns read-only (default: 3).
    pub io_error_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_size: 16 * 1024 * 1024, // 16 MB
            flush_interval: Some(Duration::from_secs(1)),
            group_commit_window: Duration::from_millis(2),
            max_batch_bytes: 1024 * 1024,
            flush_timeout: Duration::from_secs(30),
            sync_page_writes: false,
            max_pages: None,
            io_error_threshold: 3,
        }
    }
}

impl EngineConfig {
    /// Returns the number of buffer frames the pool size allows.
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.buffer_pool_size / PAGE_SIZE
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.num_frames() < 2 {
            return Err(StorageError::ConfigError(format!(
                "buffer_pool_size of {} bytes gives fewer than 2 frames of {PAGE_SIZE} bytes",
                self.buffer_pool_size
            )));
        }
        if self.io_error_threshold == 0 {
            return Err(StorageError::ConfigError(
                "io_error_threshold must be greater than 0".into(),
            ));
        }
        if self.max_batch_bytes == 0 {
            return Err(StorageError::ConfigError(
                "max_batch_bytes must be greater than 0".into(),
            ));
        }
        if self.flush_interval == Some(Duration::ZERO) {
            return Err(StorageError::ConfigError(
                "flush_interval must be non-zero; use None to disable the flusher".into(),
            ));
        }
        Ok(())
    }

    /// Returns the WAL manager settings.
    #[must_use]
    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            group_commit_window: self.group_commit_window,
            max_batch_bytes: self.max_batch_bytes,
            flush_timeout: self.flush_timeout,
        }
    }
}

/// An open database directory: data file, log and the machinery between them.
///
/// Transactions are not isolated from each other; callers serialize
/// conflicting writers to the same page.
pub struct StorageEngine {
    /// Database directory.
    path: PathBuf,
    /// Configuration the engine was opened with.
    config: EngineConfig,
    /// Write-ahead log.
    wal: Arc<WalManager>,
    /// Buffer pool over the data file.
    pool: Arc<BufferPool>,
    /// Background writer, if enabled.
    flusher: Mutex<Option<BackgroundFlusher>>,
    /// Checkpointer for WAL management.
    checkpointer: Checkpointer,
    /// Next transaction ID.
    next_txn_id: AtomicU64,
    /// Running transactions.
    transactions: TransactionTable,
    /// What recovery found at open.
    recovery_outcome: RecoveryOutcome,
    /// Set once `close` or `kill` ran.
    closed: AtomicBool,
}

impl StorageEngine {
    /// Opens or creates a database in `path`, running crash recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The directory or files cannot be created or opened
    /// - The log is corrupted before its tail (`FatalCorruption`); nothing
    ///   is modified in that case
    /// - Recovery fails to read or write a page
    pub fn open(path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::IoError(format!("Failed to create database directory: {e}"))
        })?;

        let wal_path = path.join(WAL_FILE_NAME);
        let scan = LogReader::open(&wal_path).scan()?;
        if let LogTail::Corrupt(details) = &scan.tail {
            error!(
                offset = details.offset,
                reason = %details.reason,
                "refusing to open database with a corrupted log"
            );
            return Err(StorageError::FatalCorruption {
                offset: details.offset,
                reason: details.reason.clone(),
            });
        }

        let mut log_store = LogStore::open(&wal_path)?;
        if let LogTail::Torn { offset, .. } = &scan.tail {
            log_store.truncate_to(*offset)?;
        }
        let wal = Arc::new(WalManager::start(
            log_store,
            scan.next_lsn(),
            config.wal_config(),
        )?);

        let page_store = PageStore::open(&path.join(DATA_FILE_NAME))?.with_max_pages(config.max_pages);
        let pool = Arc::new(
            BufferPool::new(config.num_frames(), page_store, wal.clone())?
                .with_sync_writes(config.sync_page_writes)
                .with_io_error_threshold(config.io_error_threshold),
        );

        let recovery_outcome = RecoveryManager::new(&pool, &wal).recover(&scan)?;
        let max_txn_id = match &recovery_outcome {
            RecoveryOutcome::Clean(report) | RecoveryOutcome::RecoveredWithLoss(report, _) => {
                report.max_txn_id
            }
            RecoveryOutcome::FatalCorruption(details) => {
                return Err(StorageError::FatalCorruption {
                    offset: details.offset,
                    reason: details.reason.clone(),
                });
            }
        };
        if let RecoveryOutcome::RecoveredWithLoss(_, loss) = &recovery_outcome {
            warn!(
                discarded_bytes = loss.discarded_bytes,
                "database opened after discarding a torn log tail"
            );
        }

        let flusher = match config.flush_interval {
            Some(interval) => Some(BackgroundFlusher::start(Arc::clone(&pool), interval)?),
            None => None,
        };

        info!(path = %path.display(), frames = pool.capacity(), next_lsn = wal.next_lsn(), "storage engine open");

        Ok(Self {
            path: path.to_path_buf(),
            config,
            wal,
            pool,
            flusher: Mutex::new(flusher),
            checkpointer: Checkpointer::new(),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            transactions: TransactionTable::new(),
            recovery_outcome,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the configuration the engine was opened with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns what recovery found when the engine was opened.
    #[must_use]
    pub fn recovery_outcome(&self) -> &RecoveryOutcome {
        &self.recovery_outcome
    }

    /// Returns the buffer pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Returns the write-ahead log.
    #[must_use]
    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    /// Returns the IDs of running transactions.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.transactions.ids()
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the `Begin` record cannot be appended.
    pub fn begin(&self) -> Result<TxnId> {
        self.ensure_open()?;
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let lsn = self.wal.append(txn_id, LogPayload::Begin)?;
        self.transactions.begin(txn_id, lsn);
        Ok(txn_id)
    }

    /// Overwrites `bytes.len()` bytes of `page_id` at absolute `offset`.
    ///
    /// The update is logged before the page changes and the page is stamped
    /// with the record's LSN. Returns that LSN. Nothing is durable until
    /// [`commit`](Self::commit).
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` for an unknown transaction,
    /// `InvalidPageWrite` for a range outside the payload, `ReadOnly` in
    /// degraded mode, or any pool or log error.
    pub fn write(&self, txn_id: TxnId, page_id: PageId, offset: usize, bytes: &[u8]) -> Result<Lsn> {
        self.ensure_open()?;
        Page::check_range(offset, bytes.len())?;
        if self.pool.is_read_only() {
            return Err(StorageError::ReadOnly(
                "writes refused after repeated I/O failures".into(),
            ));
        }
        let undo_next_lsn = self.transactions.last_lsn(txn_id)?;

        let handle = self.pool.pin(page_id)?;
        let mut page = handle.write();
        let before = page.read_range(offset, bytes.len())?.to_vec();
        let payload = LogPayload::update(page_id, offset, before.clone(), bytes.to_vec())?;

        let lsn = self.wal.append(txn_id, payload)?;
        page.write_range(offset, bytes)?;
        page.set_lsn(lsn);
        drop(page);

        self.transactions.record_update(
            txn_id,
            lsn,
            UndoEntry {
                page_id,
                offset,
                before,
                undo_next_lsn,
            },
        )?;
        Ok(lsn)
    }

    /// Reads `len` bytes of `page_id` at absolute `offset`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPageWrite` for a range outside the payload, or any
    /// error from fetching the page.
    pub fn read(&self, page_id: PageId, offset: usize, len: usize) -> Result<Vec<u8>> {
        Page::check_range(offset, len)?;
        let handle = self.pool.pin(page_id)?;
        let page = handle.read();
        Ok(page.read_range(offset, len)?.to_vec())
    }

    /// Commits a transaction and waits until its `Commit` record is durable.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` for an unknown transaction, or `WalError`
    /// if the commit could not be made durable. In the latter case the
    /// outcome is decided by recovery.
    pub fn commit(&self, txn_id: TxnId) -> Result<Lsn> {
        self.ensure_open()?;
        self.transactions.finish(txn_id)?;
        let lsn = self.wal.append(txn_id, LogPayload::Commit)?;
        self.wal.flush_up_to(lsn)?;
        Ok(lsn)
    }

    /// Rolls a transaction back, logging a CLR per undone update, then an
    /// `Abort` record.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` for an unknown transaction, or any pool or
    /// log error. A rollback cut short is finished by recovery.
    pub fn abort(&self, txn_id: TxnId) -> Result<Lsn> {
        self.ensure_open()?;
        let state = self.transactions.finish(txn_id)?;
        for entry in state.undo.iter().rev() {
            storage::recovery::compensate(
                &self.pool,
                &self.wal,
                txn_id,
                entry.page_id,
                entry.offset,
                &entry.before,
                entry.undo_next_lsn,
            )?;
        }
        let lsn = self.wal.append(txn_id, LogPayload::Abort)?;
        self.wal.flush_up_to(lsn)?;
        Ok(lsn)
    }

    /// Allocates a zeroed page in the data file.
    ///
    /// Allocation is not logged; recovery re-extends the file if an update
    /// to the page survives but the allocation did not.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if the file cannot grow or `ReadOnly` in
    /// degraded mode.
    pub fn allocate_page(&self) -> Result<PageId> {
        self.ensure_open()?;
        self.pool.allocate_page()
    }

    /// Flushes all dirty pages and writes a checkpoint record.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing or logging fails.
    pub fn checkpoint(&self) -> Result<CheckpointSummary> {
        self.ensure_open()?;
        self.checkpointer.checkpoint(&self.pool, &self.wal)
    }

    /// Shuts down cleanly: stops the flusher, checkpoints and closes the log.
    ///
    /// Running transactions are left as they are and rolled back by the next
    /// recovery. Calling `close` again does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint or log flush fails.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_flusher();
        let checkpoint = self.checkpointer.checkpoint(&self.pool, &self.wal);
        let closed = self.wal.close();
        checkpoint?;
        closed?;

        info!(path = %self.path.display(), "storage engine closed");
        Ok(())
    }

    /// Stops the background threads and drops unflushed state, as an abrupt
    /// termination would. Only what already reached disk survives.
    pub fn kill(self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.stop_flusher();
            self.wal.stop();
        }
    }

    fn stop_flusher(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.stop();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::WalError("storage engine is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        // Attempt to close gracefully, ignore errors during drop
        let _ = self.close();
    }
}
