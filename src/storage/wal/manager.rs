//! WAL manager: LSN assignment, group commit and the durability barrier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

use crate::error::{Result, StorageError};
use crate::storage::buffer_pool::LogFlush;
use crate::storage::wal::{ActiveTxnEntry, DirtyPageEntry, LogPayload, LogRecord, LogStore};
use crate::storage::{Lsn, TxnId, INVALID_LSN};

/// Group commit tuning.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// How long the coordinator waits for more flush requests before syncing.
    pub group_commit_window: Duration,
    /// Buffered bytes that close the batching window early.
    pub max_batch_bytes: usize,
    /// Upper bound on a single `flush_up_to` wait.
    pub flush_timeout: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            group_commit_window: Duration::from_millis(2),
            max_batch_bytes: 1024 * 1024,
            flush_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters exposed by [`WalManager::stats`].
#[derive(Debug, Clone, Default)]
pub struct WalStats {
    /// Records appended since start.
    pub records_appended: u64,
    /// Encoded bytes appended since start.
    pub bytes_appended: u64,
    /// Underlying fsync calls, one per committed batch.
    pub sync_calls: u64,
    /// Highest durable LSN.
    pub durable_lsn: Lsn,
    /// Highest assigned LSN.
    pub last_lsn: Lsn,
    /// Bytes buffered and not yet written.
    pub buffered_bytes: usize,
}

/// State shared by appenders, waiters and the coordinator.
struct AppendState {
    /// Encoded frames not yet handed to the log store.
    buffer: Vec<u8>,
    /// Highest assigned LSN.
    last_lsn: Lsn,
    /// Highest LSN some waiter needs durable.
    requested: Lsn,
    /// Running transactions and their most recent LSN.
    active: HashMap<TxnId, Lsn>,
    /// Set after a failed sync; the log accepts nothing afterwards.
    failed: Option<String>,
    /// Set when the manager stops.
    shutdown: bool,
}

struct WalShared {
    next_lsn: AtomicU64,
    durable_lsn: AtomicU64,
    state: Mutex<AppendState>,
    store: Mutex<LogStore>,
    /// Wakes the coordinator.
    work: Condvar,
    /// Wakes flush waiters after a batch.
    flushed: Condvar,
    config: WalConfig,
    records_appended: AtomicU64,
    bytes_appended: AtomicU64,
    sync_calls: AtomicU64,
    #[cfg(test)]
    fail_next_sync: std::sync::atomic::AtomicBool,
}

/// Write-ahead log manager.
///
/// `append` only buffers. Durability comes from [`flush_up_to`](Self::flush_up_to),
/// which hands the request to a coordinator thread that writes and fsyncs
/// every buffered record in one batch and wakes all waiters at once.
pub struct WalManager {
    shared: Arc<WalShared>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl WalManager {
    /// Starts the manager over an open log store.
    ///
    /// `next_lsn` comes from scanning the log. Every record already in the
    /// file is treated as durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be synced or the coordinator
    /// thread cannot be spawned.
    pub fn start(mut store: LogStore, next_lsn: Lsn, config: WalConfig) -> Result<Self> {
        store.sync()?;
        let next_lsn = next_lsn.max(store.header().base_lsn).max(1);
        let last_lsn = next_lsn - 1;

        let shared = Arc::new(WalShared {
            next_lsn: AtomicU64::new(next_lsn),
            durable_lsn: AtomicU64::new(last_lsn),
            state: Mutex::new(AppendState {
                buffer: Vec::new(),
                last_lsn,
                requested: last_lsn,
                active: HashMap::new(),
                failed: None,
                shutdown: false,
            }),
            store: Mutex::new(store),
            work: Condvar::new(),
            flushed: Condvar::new(),
            config,
            records_appended: AtomicU64::new(0),
            bytes_appended: AtomicU64::new(0),
            sync_calls: AtomicU64::new(0),
            #[cfg(test)]
            fail_next_sync: std::sync::atomic::AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ruzu-wal-commit".to_string())
            .spawn(move || run_coordinator(&thread_shared))
            .map_err(|e| StorageError::IoError(format!("Failed to spawn WAL thread: {e}")))?;

        debug!(next_lsn, "WAL manager started");
        Ok(Self {
            shared,
            coordinator: Mutex::new(Some(handle)),
        })
    }

    /// Appends a record and returns its LSN. Does not wait for durability.
    ///
    /// `prev_lsn` is linked from the transaction's previous record.
    ///
    /// # Errors
    ///
    /// Returns `WalError` after close, `ReadOnly` after a failed sync, or a
    /// serialization error.
    pub fn append(&self, txn_id: TxnId, payload: LogPayload) -> Result<Lsn> {
        let mut state = self.shared.state.lock();
        self.append_locked(&mut state, txn_id, payload)
    }

    fn append_locked(
        &self,
        state: &mut AppendState,
        txn_id: TxnId,
        payload: LogPayload,
    ) -> Result<Lsn> {
        if state.shutdown {
            return Err(StorageError::WalError("log is closed".into()));
        }
        if let Some(reason) = &state.failed {
            return Err(StorageError::ReadOnly(format!(
                "log sync failed earlier: {reason}"
            )));
        }

        let lsn = self.shared.next_lsn.load(Ordering::Acquire);
        let is_checkpoint = matches!(payload, LogPayload::Checkpoint { .. });
        let prev_lsn = if is_checkpoint {
            INVALID_LSN
        } else {
            state.active.get(&txn_id).copied().unwrap_or(INVALID_LSN)
        };

        let ends_transaction = payload.ends_transaction();
        let record = LogRecord::new(lsn, txn_id, prev_lsn, payload);
        let frame = record.encode_frame()?;

        self.shared.next_lsn.store(lsn + 1, Ordering::Release);
        if ends_transaction {
            state.active.remove(&txn_id);
        } else if !is_checkpoint {
            state.active.insert(txn_id, lsn);
        }

        state.buffer.extend_from_slice(&frame);
        state.last_lsn = lsn;
        self.shared.records_appended.fetch_add(1, Ordering::Relaxed);
        self.shared
            .bytes_appended
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        // A large backlog gets written even if nobody is waiting on it yet.
        if state.buffer.len() >= self.shared.config.max_batch_bytes {
            state.requested = state.requested.max(lsn);
            self.shared.work.notify_one();
        }

        trace!(lsn, txn_id, prev_lsn, "appended log record");
        Ok(lsn)
    }

    /// Blocks until every record with LSN `<= lsn` is durable.
    ///
    /// Requests past the last assigned LSN are clamped to it.
    ///
    /// # Errors
    ///
    /// Returns `WalError` if the batch carrying the record failed to sync,
    /// the log was closed, or `flush_timeout` elapsed.
    pub fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        if lsn <= self.durable_lsn() {
            return Ok(());
        }

        let deadline = Instant::now() + self.shared.config.flush_timeout;
        let mut state = self.shared.state.lock();
        let target = lsn.min(state.last_lsn);

        loop {
            if self.durable_lsn() >= target {
                return Ok(());
            }
            if let Some(reason) = &state.failed {
                return Err(StorageError::WalError(format!("log sync failed: {reason}")));
            }
            if state.shutdown {
                return Err(StorageError::WalError(
                    "log closed before the flush completed".into(),
                ));
            }

            if state.requested < target {
                state.requested = target;
                self.shared.work.notify_one();
            }

            if self
                .shared
                .flushed
                .wait_until(&mut state, deadline)
                .timed_out()
                && self.durable_lsn() < target
            {
                return Err(StorageError::WalError(format!(
                    "timed out waiting for LSN {target} to become durable"
                )));
            }
        }
    }

    /// Makes every appended record durable.
    ///
    /// # Errors
    ///
    /// Same as [`flush_up_to`](Self::flush_up_to).
    pub fn flush_all(&self) -> Result<()> {
        self.flush_up_to(self.last_lsn())
    }

    /// Appends a checkpoint record and forces it.
    ///
    /// `redo_lsn` must be read with [`next_lsn`](Self::next_lsn) before the
    /// dirty-page snapshot was taken. The active-transaction list is
    /// captured atomically with the append.
    ///
    /// # Errors
    ///
    /// Returns an error if the append or the flush fails.
    pub fn checkpoint(&self, redo_lsn: Lsn, dirty_pages: Vec<DirtyPageEntry>) -> Result<Lsn> {
        let lsn = {
            let mut state = self.shared.state.lock();
            let mut active_txns: Vec<ActiveTxnEntry> = state
                .active
                .iter()
                .map(|(&txn_id, &last_lsn)| ActiveTxnEntry { txn_id, last_lsn })
                .collect();
            active_txns.sort_by_key(|entry| entry.txn_id);

            let payload = LogPayload::Checkpoint {
                redo_lsn,
                dirty_pages,
                active_txns,
            };
            self.append_locked(&mut state, 0, payload)?
        };

        self.flush_up_to(lsn)?;
        Ok(lsn)
    }

    /// Seeds the active-transaction table. Recovery calls this for losers so
    /// CLRs link to their last record.
    pub fn register_active(&self, txn_id: TxnId, last_lsn: Lsn) {
        self.shared.state.lock().active.insert(txn_id, last_lsn);
    }

    /// Returns the running transactions, sorted by ID.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<ActiveTxnEntry> {
        let state = self.shared.state.lock();
        let mut active: Vec<ActiveTxnEntry> = state
            .active
            .iter()
            .map(|(&txn_id, &last_lsn)| ActiveTxnEntry { txn_id, last_lsn })
            .collect();
        active.sort_by_key(|entry| entry.txn_id);
        active
    }

    /// Empties the log if nothing in it can still be needed.
    ///
    /// That requires no running transaction, every record durable, and
    /// `has_dirty_pages` reporting `false`. It is checked under the append
    /// lock, so it must not block on page latches. The new base LSN keeps
    /// LSNs increasing.
    ///
    /// Returns whether the log was truncated.
    ///
    /// # Errors
    ///
    /// Returns an error if rewriting the log fails.
    pub fn truncate_if_quiescent(&self, has_dirty_pages: impl FnOnce() -> bool) -> Result<bool> {
        let state = self.shared.state.lock();
        if !state.active.is_empty()
            || !state.buffer.is_empty()
            || state.failed.is_some()
            || self.durable_lsn() < state.last_lsn
            || has_dirty_pages()
        {
            return Ok(false);
        }

        let base_lsn = self.shared.next_lsn.load(Ordering::Acquire);
        self.shared.store.lock().reset(base_lsn)?;
        drop(state);

        debug!(base_lsn, "truncated quiescent WAL");
        Ok(true)
    }

    /// Returns the LSN the next append will receive.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        self.shared.next_lsn.load(Ordering::Acquire)
    }

    /// Returns the highest assigned LSN.
    #[must_use]
    pub fn last_lsn(&self) -> Lsn {
        self.shared.state.lock().last_lsn
    }

    /// Returns the highest LSN known to be durable.
    #[must_use]
    pub fn durable_lsn(&self) -> Lsn {
        self.shared.durable_lsn.load(Ordering::Acquire)
    }

    /// Returns whether a failed sync poisoned the log.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failed.is_some()
    }

    /// Returns the size of the log file in bytes.
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.shared.store.lock().len()
    }

    /// Returns the append and sync counters.
    #[must_use]
    pub fn stats(&self) -> WalStats {
        let state = self.shared.state.lock();
        WalStats {
            records_appended: self.shared.records_appended.load(Ordering::Relaxed),
            bytes_appended: self.shared.bytes_appended.load(Ordering::Relaxed),
            sync_calls: self.shared.sync_calls.load(Ordering::Relaxed),
            durable_lsn: self.durable_lsn(),
            last_lsn: state.last_lsn,
            buffered_bytes: state.buffer.len(),
        }
    }

    /// Flushes everything and stops the coordinator.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails; the coordinator is stopped
    /// either way.
    pub fn close(&self) -> Result<()> {
        let result = self.flush_all();
        self.stop();
        result
    }

    /// Stops the coordinator without flushing. Buffered records are lost, as
    /// they would be in a crash.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
            self.shared.flushed.notify_all();
        }

        if let Some(handle) = self.coordinator.lock().take() {
            if handle.join().is_err() {
                error!("WAL coordinator panicked");
            }
        }
    }

    /// Makes the next batch sync fail.
    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        self.shared.fail_next_sync.store(true, Ordering::Release);
    }
}

impl LogFlush for WalManager {
    fn flush_up_to(&self, lsn: Lsn) -> Result<()> {
        WalManager::flush_up_to(self, lsn)
    }

    fn durable_lsn(&self) -> Lsn {
        WalManager::durable_lsn(self)
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_coordinator(shared: &WalShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        let pending = state.failed.is_none()
            && !state.buffer.is_empty()
            && state.requested > shared.durable_lsn.load(Ordering::Acquire);
        if !pending {
            shared.work.wait(&mut state);
            continue;
        }

        // Batching window: let more appenders and waiters join this sync.
        let deadline = Instant::now() + shared.config.group_commit_window;
        while !state.shutdown && state.buffer.len() < shared.config.max_batch_bytes {
            if shared.work.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.shutdown {
            return;
        }

        commit_batch(shared, &mut state);
    }
}

fn commit_batch(shared: &WalShared, state: &mut MutexGuard<'_, AppendState>) {
    let batch = std::mem::take(&mut state.buffer);
    let batch_end = state.last_lsn;

    let result = MutexGuard::unlocked(state, || {
        let mut store = shared.store.lock();
        store.append(&batch)?;

        #[cfg(test)]
        if shared.fail_next_sync.swap(false, Ordering::AcqRel) {
            return Err(StorageError::IoError("injected sync failure".into()));
        }

        store.sync()
    });
    shared.sync_calls.fetch_add(1, Ordering::Relaxed);

    match result {
        Ok(()) => {
            shared.durable_lsn.store(batch_end, Ordering::Release);
            debug!(batch_end, bytes = batch.len(), "group commit");
        }
        Err(e) => {
            error!(batch_end, error = %e, "WAL sync failed; log is now read-only");
            state.failed = Some(e.to_string());
        }
    }

    shared.flushed.notify_all();
}
