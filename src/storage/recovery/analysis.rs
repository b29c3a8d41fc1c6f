//! Analysis pass: rebuilds the dirty-page and transaction tables.

use std::collections::HashMap;

use crate::storage::page::PageId;
use crate::storage::wal::{LogPayload, LogRecord};
use crate::storage::{Lsn, TxnId, INVALID_LSN};

/// State reconstructed from the log.
#[derive(Debug, Default)]
pub(crate) struct Analysis {
    /// Pages whose on-disk copy may be missing updates, with the earliest such LSN.
    pub dirty_pages: HashMap<PageId, Lsn>,
    /// Transactions without a `Commit` or `Abort`, with their last LSN.
    pub losers: HashMap<TxnId, Lsn>,
    /// LSN of the checkpoint analysis started from, if any.
    pub checkpoint_lsn: Option<Lsn>,
    /// Highest transaction ID seen anywhere in the log.
    pub max_txn_id: TxnId,
}

impl Analysis {
    /// Runs analysis over verified records in LSN order.
    ///
    /// Starts from the last checkpoint when there is one. Its dirty pages are
    /// extended by every update from its `redo_lsn` on, and its active list
    /// by every record after it.
    pub(crate) fn run(records: &[LogRecord]) -> Self {
        let mut analysis = Analysis {
            max_txn_id: records.iter().map(|r| r.txn_id).max().unwrap_or(0),
            ..Analysis::default()
        };

        let checkpoint = records.iter().rev().find_map(|record| match &record.payload {
            LogPayload::Checkpoint {
                redo_lsn,
                dirty_pages,
                active_txns,
            } => Some((record.lsn, *redo_lsn, dirty_pages, active_txns)),
            _ => None,
        });

        let (dirty_from, txns_after) = match checkpoint {
            Some((ckpt_lsn, redo_lsn, dirty_pages, active_txns)) => {
                for entry in dirty_pages {
                    analysis
                        .dirty_pages
                        .entry(entry.page_id)
                        .and_modify(|rec| *rec = (*rec).min(entry.rec_lsn))
                        .or_insert(entry.rec_lsn);
                }
                for entry in active_txns {
                    analysis.losers.insert(entry.txn_id, entry.last_lsn);
                    analysis.max_txn_id = analysis.max_txn_id.max(entry.txn_id);
                }
                analysis.checkpoint_lsn = Some(ckpt_lsn);
                (redo_lsn.min(ckpt_lsn), ckpt_lsn)
            }
            None => (INVALID_LSN, INVALID_LSN),
        };

        for record in records.iter().filter(|r| r.lsn >= dirty_from) {
            if let Some((page_id, _, _)) = record.payload.redo_image() {
                analysis.dirty_pages.entry(page_id).or_insert(record.lsn);
            }

            if record.lsn <= txns_after {
                continue;
            }
            match &record.payload {
                LogPayload::Checkpoint { .. } => {}
                LogPayload::Commit | LogPayload::Abort => {
                    analysis.losers.remove(&record.txn_id);
                }
                _ => {
                    analysis.losers.insert(record.txn_id, record.lsn);
                }
            }
        }

        analysis
    }

    /// Returns where redo starts: the smallest recovery LSN, if any page is dirty.
    pub(crate) fn redo_start(&self) -> Option<Lsn> {
        self.dirty_pages.values().min().copied()
    }
}
