//! Buffer frame for holding a single cached page.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::storage::page::{Page, PageId};
use crate::storage::{Lsn, INVALID_LSN};

/// A frame in the buffer pool that holds a single page.
///
/// Each frame tracks:
/// - The page bytes, behind a per-frame read/write latch
/// - How many callers are currently using the page (pin count)
/// - Whether the page differs from its on-disk copy (dirty)
/// - The LSN of the first update since the page was last clean (`rec_lsn`)
///
/// Pin count and dirty state are atomics so they can be read and adjusted
/// without the pool-wide lock. Pins are only ever *added* under that lock,
/// which lets victim selection trust a zero pin count it observes there.
#[derive(Debug)]
pub struct BufferFrame {
    /// Index of this frame in the buffer pool.
    frame_id: usize,
    /// Page currently held by this frame.
    page: RwLock<Page>,
    /// Number of active references to this page.
    pin_count: AtomicU32,
    /// Whether the page has been modified since last flush.
    dirty: AtomicBool,
    /// LSN of the update that first dirtied the page.
    rec_lsn: AtomicU64,
}

impl BufferFrame {
    /// Creates a new empty buffer frame.
    #[must_use]
    pub fn new(frame_id: usize) -> Self {
        Self {
            frame_id,
            page: RwLock::new(Page::new(PageId::new(0))),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            rec_lsn: AtomicU64::new(INVALID_LSN),
        }
    }

    /// Returns the index of this frame.
    #[must_use]
    pub fn frame_id(&self) -> usize {
        self.frame_id
    }

    /// Returns the latch guarding the page bytes.
    #[must_use]
    pub fn page(&self) -> &RwLock<Page> {
        &self.page
    }

    /// Increments the pin count and returns the new value.
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the pin count.
    ///
    /// Returns `false` without changing anything if the count is already zero.
    pub fn try_unpin(&self) -> bool {
        self.pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    /// Returns the current pin count.
    #[must_use]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Returns whether the page has unflushed modifications.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Returns the recovery LSN if the frame is dirty.
    #[must_use]
    pub fn rec_lsn(&self) -> Option<Lsn> {
        self.is_dirty()
            .then(|| self.rec_lsn.load(Ordering::Acquire))
    }

    /// Marks the frame dirty. A clean frame records `lsn` as its recovery LSN;
    /// an already dirty frame keeps the older one.
    pub fn mark_dirty(&self, lsn: Lsn) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.rec_lsn.store(lsn, Ordering::Release);
        }
    }

    /// Clears the dirty flag once the page has reached disk.
    ///
    /// Callers hold a read latch across the write and this call, so no
    /// writer can modify the page in between.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
        self.rec_lsn.store(INVALID_LSN, Ordering::Release);
    }

    /// Loads a page into this frame, resetting its bookkeeping.
    ///
    /// The caller owns the frame exclusively (it is not in the page table).
    pub fn reset(&self, page: Page) {
        *self.page.write() = page;
        self.dirty.store(false, Ordering::Release);
        self.rec_lsn.store(INVALID_LSN, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
    }
}
