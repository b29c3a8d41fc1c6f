//! Checkpoint coordination for WAL management.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::error::Result;
use crate::storage::buffer_pool::BufferPool;
use crate::storage::wal::WalManager;
use crate::storage::Lsn;

/// What a checkpoint did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSummary {
    /// Sequential checkpoint number within this process.
    pub checkpoint_id: u64,
    /// LSN of the checkpoint record.
    pub lsn: Lsn,
    /// Dirty pages written before the record was logged.
    pub pages_flushed: usize,
    /// Whether the log could be emptied afterwards.
    pub log_truncated: bool,
}

/// Coordinates checkpoints to flush dirty pages and bound recovery work.
pub struct Checkpointer {
    /// Next checkpoint ID.
    next_checkpoint_id: AtomicU64,
}

impl Checkpointer {
    /// Creates a new checkpointer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_checkpoint_id: AtomicU64::new(1),
        }
    }

    /// Returns and increments the next checkpoint ID.
    pub fn next_id(&self) -> u64 {
        self.next_checkpoint_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the current checkpoint ID (without incrementing).
    #[must_use]
    pub fn current_id(&self) -> u64 {
        self.next_checkpoint_id.load(Ordering::Relaxed)
    }

    /// Performs a checkpoint.
    ///
    /// This:
    /// 1. Writes back every dirty page (forcing the log first)
    /// 2. Captures the redo point, then snapshots pages dirtied since
    /// 3. Logs and forces a checkpoint record with that snapshot and the
    ///    running transactions
    /// 4. Empties the log if nothing in it is still needed
    ///
    /// Transactions may keep running throughout.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    pub fn checkpoint(&self, pool: &BufferPool, wal: &WalManager) -> Result<CheckpointSummary> {
        let checkpoint_id = self.next_id();

        let pages_flushed = pool.flush_all()?;

        // Any update logged from here on is at or after redo_lsn, so recovery
        // covers it even if the snapshot below misses its page.
        let redo_lsn = wal.next_lsn();
        let dirty_pages = pool.dirty_page_table();
        let dirty_count = dirty_pages.len();

        let lsn = wal.checkpoint(redo_lsn, dirty_pages)?;
        let log_truncated = wal.truncate_if_quiescent(|| pool.has_dirty_pages())?;

        info!(
            checkpoint_id,
            lsn,
            redo_lsn,
            pages_flushed,
            dirty_pages = dirty_count,
            log_truncated,
            "checkpoint complete"
        );

        Ok(CheckpointSummary {
            checkpoint_id,
            lsn,
            pages_flushed,
            log_truncated,
        })
    }
}

impl Default for Checkpointer {
    fn default() -> Self {
        Self::new()
    }
}
