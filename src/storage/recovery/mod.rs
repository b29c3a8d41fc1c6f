//! Crash recovery.
//!
//! Recovery runs once at startup, before any transaction is admitted, in
//! three passes over the verified prefix of the log:
//!
//! 1. **Analysis** rebuilds the dirty-page table and the set of losers
//!    (transactions with neither `Commit` nor `Abort`), starting from the
//!    last checkpoint.
//! 2. **Redo** repeats history: every update and CLR from the smallest
//!    recovery LSN on is applied unless the page already reflects it.
//! 3. **Undo** rolls losers back newest-first, logging a CLR for every
//!    undone update and an `Abort` once a transaction is fully undone.
//!
//! Redo is idempotent through the page LSN and undo through the CLR chain,
//! so a crash during recovery is handled by running it again.

mod analysis;

use std::collections::{BinaryHeap, HashMap};

use tracing::{debug, error, info, warn};

use crate::error::{Result, StorageError};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::PageId;
use crate::storage::wal::{CorruptionDetails, LogPayload, LogRecord, LogScan, LogTail, WalManager};
use crate::storage::{Lsn, TxnId, INVALID_LSN};

use analysis::Analysis;

/// Counters describing one recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Verified records found in the log.
    pub records_scanned: usize,
    /// LSN of the checkpoint analysis started from.
    pub checkpoint_lsn: Option<Lsn>,
    /// First LSN redo considered, if any page needed redo.
    pub redo_start_lsn: Option<Lsn>,
    /// Records whose image was applied during redo.
    pub redo_applied: usize,
    /// Records redo skipped because the page already reflected them.
    pub redo_skipped: usize,
    /// Transactions rolled back.
    pub losers: Vec<TxnId>,
    /// CLRs appended during undo.
    pub clrs_written: usize,
    /// Highest transaction ID in the log.
    pub max_txn_id: TxnId,
    /// Last LSN in the log after recovery.
    pub last_lsn: Lsn,
}

/// A torn log tail discarded before recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLoss {
    /// Offset of the first discarded byte.
    pub offset: u64,
    /// Number of discarded bytes.
    pub discarded_bytes: u64,
    /// Why the trailing frame was rejected.
    pub reason: String,
}

/// How recovery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The log was intact.
    Clean(RecoveryReport),
    /// A torn tail was discarded; everything before it was recovered.
    RecoveredWithLoss(RecoveryReport, DataLoss),
    /// Mid-log corruption; nothing was applied.
    FatalCorruption(CorruptionDetails),
}

impl RecoveryOutcome {
    /// Returns the report unless recovery was refused.
    #[must_use]
    pub fn report(&self) -> Option<&RecoveryReport> {
        match self {
            RecoveryOutcome::Clean(report) | RecoveryOutcome::RecoveredWithLoss(report, _) => {
                Some(report)
            }
            RecoveryOutcome::FatalCorruption(_) => None,
        }
    }

    /// Returns whether any log bytes were discarded.
    #[must_use]
    pub fn lost_data(&self) -> bool {
        matches!(self, RecoveryOutcome::RecoveredWithLoss(..))
    }
}

/// Replays a scanned log against the buffer pool.
pub struct RecoveryManager<'a> {
    pool: &'a BufferPool,
    wal: &'a WalManager,
}

impl<'a> RecoveryManager<'a> {
    /// Creates a recovery manager over a started WAL and its buffer pool.
    #[must_use]
    pub fn new(pool: &'a BufferPool, wal: &'a WalManager) -> Self {
        Self { pool, wal }
    }

    /// Runs analysis, redo and undo over `scan`.
    ///
    /// `scan` must come from the log the WAL manager was started on, with any
    /// torn tail already cut off. Corruption yields
    /// [`RecoveryOutcome::FatalCorruption`] without touching any page.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or written, or the log
    /// cannot be appended to or flushed. Any such error is fatal.
    pub fn recover(&self, scan: &LogScan) -> Result<RecoveryOutcome> {
        let loss = match &scan.tail {
            LogTail::Corrupt(details) => {
                error!(
                    offset = details.offset,
                    reason = %details.reason,
                    "log corrupted mid-stream; refusing to recover"
                );
                return Ok(RecoveryOutcome::FatalCorruption(details.clone()));
            }
            LogTail::Torn {
                offset,
                discarded_bytes,
                reason,
            } => {
                warn!(offset, discarded_bytes, %reason, "recovering without torn log tail");
                Some(DataLoss {
                    offset: *offset,
                    discarded_bytes: *discarded_bytes,
                    reason: reason.clone(),
                })
            }
            LogTail::Clean => None,
        };

        let records = &scan.records;
        let analysis = Analysis::run(records);
        info!(
            records = records.len(),
            checkpoint_lsn = ?analysis.checkpoint_lsn,
            dirty_pages = analysis.dirty_pages.len(),
            losers = analysis.losers.len(),
            "recovery analysis complete"
        );

        let mut report = RecoveryReport {
            records_scanned: records.len(),
            checkpoint_lsn: analysis.checkpoint_lsn,
            redo_start_lsn: analysis.redo_start(),
            max_txn_id: analysis.max_txn_id,
            ..RecoveryReport::default()
        };

        self.redo(records, &analysis, &mut report)?;
        info!(
            redo_start_lsn = ?report.redo_start_lsn,
            applied = report.redo_applied,
            skipped = report.redo_skipped,
            "recovery redo complete"
        );

        self.undo(records, &analysis.losers, &mut report)?;
        self.wal.flush_all()?;
        report.last_lsn = self.wal.last_lsn();
        info!(
            losers = report.losers.len(),
            clrs = report.clrs_written,
            last_lsn = report.last_lsn,
            "recovery undo complete"
        );

        Ok(match loss {
            Some(loss) => RecoveryOutcome::RecoveredWithLoss(report, loss),
            None => RecoveryOutcome::Clean(report),
        })
    }

    fn redo(
        &self,
        records: &[LogRecord],
        analysis: &Analysis,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let Some(start) = analysis.redo_start() else {
            return Ok(());
        };

        for record in records.iter().filter(|r| r.lsn >= start) {
            let Some((page_id, offset, image)) = record.payload.redo_image() else {
                continue;
            };
            // Pages absent from the table, or whose recovery LSN is later,
            // already hold this update on disk.
            match analysis.dirty_pages.get(&page_id) {
                Some(&rec_lsn) if record.lsn >= rec_lsn => {}
                _ => {
                    report.redo_skipped += 1;
                    continue;
                }
            }

            // The allocation may not have reached disk before the crash.
            self.pool.ensure_allocated(page_id)?;
            let handle = self.pool.pin(page_id)?;
            if handle.read().lsn() >= record.lsn {
                report.redo_skipped += 1;
                continue;
            }

            let mut page = handle.write();
            page.write_range(offset, image)?;
            page.set_lsn(record.lsn);
            report.redo_applied += 1;
        }

        Ok(())
    }

    fn undo(
        &self,
        records: &[LogRecord],
        losers: &HashMap<TxnId, Lsn>,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        if losers.is_empty() {
            return Ok(());
        }

        let by_lsn: HashMap<Lsn, &LogRecord> = records.iter().map(|r| (r.lsn, r)).collect();

        // New CLRs must chain onto each loser's last record.
        let mut pending = BinaryHeap::new();
        for (&txn_id, &last_lsn) in losers {
            self.wal.register_active(txn_id, last_lsn);
            pending.push((last_lsn, txn_id));
            report.losers.push(txn_id);
        }
        report.losers.sort_unstable();

        // Always undo the newest outstanding record across all losers.
        while let Some((lsn, txn_id)) = pending.pop() {
            let next = if lsn == INVALID_LSN {
                INVALID_LSN
            } else {
                let record = by_lsn.get(&lsn).ok_or_else(|| {
                    StorageError::CorruptedLog(format!(
                        "undo of transaction {txn_id} needs LSN {lsn}, which is not in the log"
                    ))
                })?;
                match &record.payload {
                    LogPayload::Update {
                        page_id,
                        offset,
                        before,
                        ..
                    } => {
                        compensate(
                            self.pool,
                            self.wal,
                            txn_id,
                            *page_id,
                            *offset as usize,
                            before,
                            record.prev_lsn,
                        )?;
                        report.clrs_written += 1;
                        record.prev_lsn
                    }
                    LogPayload::Compensation { undo_next_lsn, .. } => *undo_next_lsn,
                    LogPayload::Begin => INVALID_LSN,
                    _ => record.prev_lsn,
                }
            };

            if next == INVALID_LSN {
                self.wal.append(txn_id, LogPayload::Abort)?;
                debug!(txn_id, "rolled back loser");
            } else {
                pending.push((next, txn_id));
            }
        }

        Ok(())
    }
}

/// Restores `image` at `offset` on `page_id` and logs it as a CLR.
///
/// The CLR is appended while the page latch is held, so the page LSN and log
/// order agree. Used by recovery undo and by runtime aborts.
///
/// # Errors
///
/// Returns an error if the page cannot be pinned or the record cannot be
/// appended.
pub(crate) fn compensate(
    pool: &BufferPool,
    wal: &WalManager,
    txn_id: TxnId,
    page_id: PageId,
    offset: usize,
    image: &[u8],
    undo_next_lsn: Lsn,
) -> Result<Lsn> {
    pool.ensure_allocated(page_id)?;
    let handle = pool.pin(page_id)?;
    let mut page = handle.write();

    let lsn = wal.append(
        txn_id,
        LogPayload::Compensation {
            page_id,
            offset: offset as u32,
            image: image.to_vec(),
            undo_next_lsn,
        },
    )?;
    page.write_range(offset, image)?;
    page.set_lsn(lsn);
    Ok(lsn)
}
