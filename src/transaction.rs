//! Bookkeeping for transactions running through [`StorageEngine`](crate::StorageEngine).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::storage::page::PageId;
use crate::storage::{Lsn, TxnId};

/// Everything needed to undo one update without reading the log back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoEntry {
    pub page_id: PageId,
    pub offset: usize,
    pub before: Vec<u8>,
    /// The transaction's record preceding the update.
    pub undo_next_lsn: Lsn,
}

/// A running transaction.
#[derive(Debug, Default)]
pub(crate) struct TxnState {
    /// LSN of the transaction's most recent record.
    pub last_lsn: Lsn,
    /// Updates in the order they were made.
    pub undo: Vec<UndoEntry>,
}

/// Running transactions keyed by ID.
#[derive(Default)]
pub(crate) struct TransactionTable {
    txns: Mutex<HashMap<TxnId, TxnState>>,
}

impl TransactionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction whose `Begin` record has LSN `begin_lsn`.
    pub(crate) fn begin(&self, txn_id: TxnId, begin_lsn: Lsn) {
        self.txns.lock().insert(
            txn_id,
            TxnState {
                last_lsn: begin_lsn,
                undo: Vec::new(),
            },
        );
    }

    /// Returns the LSN of the transaction's most recent record.
    pub(crate) fn last_lsn(&self, txn_id: TxnId) -> Result<Lsn> {
        self.txns
            .lock()
            .get(&txn_id)
            .map(|state| state.last_lsn)
            .ok_or_else(|| Self::unknown(txn_id))
    }

    /// Records an update logged at `lsn`.
    pub(crate) fn record_update(&self, txn_id: TxnId, lsn: Lsn, entry: UndoEntry) -> Result<()> {
        let mut txns = self.txns.lock();
        let state = txns.get_mut(&txn_id).ok_or_else(|| Self::unknown(txn_id))?;
        state.last_lsn = lsn;
        state.undo.push(entry);
        Ok(())
    }

    /// Removes a transaction that is about to commit or abort.
    pub(crate) fn finish(&self, txn_id: TxnId) -> Result<TxnState> {
        self.txns
            .lock()
            .remove(&txn_id)
            .ok_or_else(|| Self::unknown(txn_id))
    }

    /// Returns the running transaction IDs, sorted.
    pub(crate) fn ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.txns.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn unknown(txn_id: TxnId) -> StorageError {
        StorageError::TransactionError(format!("transaction {txn_id} is not active"))
    }
}
