//! Buffer pool management for page caching.
//!
//! This module implements a buffer pool that manages in-memory caching of database pages.
//! It provides:
//! - Page pinning and unpinning with atomic reference counting
//! - LRU eviction among unpinned frames
//! - Dirty tracking with the write-ahead rule enforced on every write-back
//! - RAII guards (`PageHandle`, `PageWriteGuard`) for safe page access
//!
//! # Architecture
//!
//! Frames are a fixed array allocated at construction. The page table, free
//! list and LRU replacer sit behind one pool-wide mutex that is only held for
//! bookkeeping, never across disk I/O. Each frame has its own read/write latch
//! for the page bytes. Locks are always taken in the order
//! page store, pool state, frame latch.
//!
//! # Example
//!
//! ```ignore
//! let pool = BufferPool::new(capacity, store, wal)?;
//! let handle = pool.pin(page_id)?;
//! let lsn = handle.read().lsn();
//! // Page automatically unpinned when handle drops
//! ```

mod buffer_frame;
mod eviction;
mod flusher;

pub use buffer_frame::BufferFrame;
pub use eviction::LruReplacer;
pub use flusher::BackgroundFlusher;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, trace, warn};

use crate::error::{Result, StorageError};
use crate::storage::page::{Page, PageId, PageStore};
use crate::storage::wal::DirtyPageEntry;
use crate::storage::Lsn;

/// Durability barrier the buffer pool consults before writing a page.
///
/// Implemented by the WAL manager; tests substitute their own.
pub trait LogFlush: Send + Sync {
    /// Blocks until every record with LSN `<= lsn` is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be synced.
    fn flush_up_to(&self, lsn: Lsn) -> Result<()>;

    /// Returns the highest LSN known to be durable.
    fn durable_lsn(&self) -> Lsn;
}

/// Bookkeeping protected by the pool-wide lock.
struct PoolState {
    /// Maps resident page IDs to frame indices.
    page_table: HashMap<PageId, usize>,
    /// Frames that hold no page.
    free_list: Vec<usize>,
    /// Recency order of resident frames.
    replacer: LruReplacer,
}

/// Outcome of trying to place a page into a frame.
enum Placement {
    /// The page is resident and pinned in this frame.
    Ready(usize),
    /// The LRU victim is dirty; it is pinned and must be written back first.
    WriteBack(usize),
}

/// Buffer pool for managing in-memory page cache.
pub struct BufferPool {
    /// Buffer frames holding cached pages.
    frames: Vec<BufferFrame>,
    /// Page table, free list and replacer.
    state: Mutex<PoolState>,
    /// Page store for page I/O.
    store: Mutex<PageStore>,
    /// Log consulted before any dirty page reaches disk.
    log: Arc<dyn LogFlush>,
    /// Whether page writes are synced individually.
    sync_writes: bool,
    /// Consecutive I/O failures tolerated before turning read-only.
    io_error_threshold: u32,
    /// Consecutive I/O failures seen on write-back.
    io_failures: AtomicU32,
    /// Set once writes are refused.
    read_only: AtomicBool,
    /// Counter for cache hits (page found in buffer pool).
    cache_hits: AtomicU64,
    /// Counter for cache misses (page had to be loaded from disk).
    cache_misses: AtomicU64,
    /// Counter for number of pages evicted.
    evictions: AtomicU64,
    /// Counter for pages written back to the store.
    pages_flushed: AtomicU64,
}

impl BufferPool {
    /// Creates a new buffer pool with the given capacity, page store and log.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of frames
    /// * `store` - Page store for reading/writing pages
    /// * `log` - Log that must be durable past a page's LSN before that page is written
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the capacity is zero.
    pub fn new(capacity: usize, store: PageStore, log: Arc<dyn LogFlush>) -> Result<Self> {
        if capacity == 0 {
            return Err(StorageError::ConfigError(
                "Buffer pool capacity must be greater than 0".into(),
            ));
        }

        let frames = (0..capacity).map(BufferFrame::new).collect();

        Ok(Self {
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(capacity),
                free_list: (0..capacity).rev().collect(),
                replacer: LruReplacer::new(capacity),
            }),
            store: Mutex::new(store),
            log,
            sync_writes: false,
            io_error_threshold: 3,
            io_failures: AtomicU32::new(0),
            read_only: AtomicBool::new(false),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            pages_flushed: AtomicU64::new(0),
        })
    }

    /// Syncs every page write individually instead of only on `flush_all`.
    #[must_use]
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Sets how many consecutive write-back I/O failures turn the pool read-only.
    #[must_use]
    pub fn with_io_error_threshold(mut self, threshold: u32) -> Self {
        self.io_error_threshold = threshold.max(1);
        self
    }

    /// Returns the capacity of the buffer pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of pages currently in the buffer pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Returns whether the page is resident.
    #[must_use]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    /// Returns the pin count of a resident page.
    #[must_use]
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&idx| self.frames[idx].pin_count())
    }

    /// Returns whether writes are refused after repeated I/O failures.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Fetches a page and pins it, loading it from the page store on a miss.
    ///
    /// The caller must release the pin with [`FrameRef::unpin`] or
    /// [`unpin_page`](Self::unpin_page).
    ///
    /// # Errors
    ///
    /// Returns `PoolExhausted` if every frame is pinned, or any error from
    /// reading the page or writing back a dirty victim.
    pub fn fetch_page(&self, page_id: PageId) -> Result<FrameRef<'_>> {
        if let Some(frame_idx) = self.pin_resident(page_id, true) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(FrameRef {
                pool: self,
                frame_idx,
                page_id,
            });
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let frame_idx = self.load(|store| store.read_page(page_id))?;
        Ok(FrameRef {
            pool: self,
            frame_idx,
            page_id,
        })
    }

    /// Pins a page and returns an RAII handle that unpins on drop.
    ///
    /// # Errors
    ///
    /// Same as [`fetch_page`](Self::fetch_page).
    pub fn pin(&self, page_id: PageId) -> Result<PageHandle<'_>> {
        let frame = self.fetch_page(page_id)?;
        Ok(PageHandle { frame })
    }

    /// Allocates a new page and pins it in the buffer pool.
    ///
    /// # Errors
    ///
    /// Returns an error if no frames are available or allocation fails.
    pub fn new_page(&self) -> Result<PageHandle<'_>> {
        let page_id = self.allocate_page()?;
        // Freshly extended file space reads as zeros, so the frame starts clean.
        let frame_idx = self.load(|_| Ok(Page::new(page_id)))?;
        Ok(PageHandle {
            frame: FrameRef {
                pool: self,
                frame_idx,
                page_id,
            },
        })
    }

    /// Allocates a page in the store without caching it.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` in degraded mode or `OutOfSpace` if the file cannot grow.
    pub fn allocate_page(&self) -> Result<PageId> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly(
                "page allocation refused after repeated I/O failures".into(),
            ));
        }
        self.store.lock().allocate()
    }

    /// Grows the store so that `page_id` exists.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if the file cannot grow.
    pub fn ensure_allocated(&self, page_id: PageId) -> Result<()> {
        self.store.lock().ensure_allocated(page_id)
    }

    /// Returns the total number of pages allocated in the data file.
    #[must_use]
    pub fn num_pages(&self) -> u32 {
        self.store.lock().num_pages()
    }

    /// Releases one pin on a page, marking it dirty first if `is_dirty`.
    ///
    /// # Errors
    ///
    /// Returns `NotPinned` if the page is not resident or its pin count is zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let frame_idx = {
            let state = self.state.lock();
            state
                .page_table
                .get(&page_id)
                .copied()
                .filter(|&idx| self.frames[idx].pin_count() > 0)
        };

        match frame_idx {
            Some(idx) => self.unpin_frame(idx, page_id, is_dirty),
            None => {
                error!(%page_id, "unpin of a page that is not pinned");
                Err(StorageError::NotPinned(page_id))
            }
        }
    }

    fn unpin_frame(&self, frame_idx: usize, page_id: PageId, is_dirty: bool) -> Result<()> {
        let frame = &self.frames[frame_idx];
        if is_dirty {
            let lsn = frame.page().read().lsn();
            frame.mark_dirty(lsn);
        }
        if frame.try_unpin() {
            Ok(())
        } else {
            error!(%page_id, "unpin of a page that is not pinned");
            Err(StorageError::NotPinned(page_id))
        }
    }

    /// Flushes a specific page to disk if it's dirty. The page stays resident.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or the page cannot be written.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let Some(frame_idx) = self.pin_resident(page_id, false) else {
            return Ok(()); // Page not in pool, nothing to flush
        };

        let result = self.write_back(frame_idx);
        self.frames[frame_idx].try_unpin();
        result.map(|_| ())
    }

    /// Flushes all dirty pages, pinned or not, then syncs the data file.
    ///
    /// Returns the number of pages written.
    ///
    /// # Errors
    ///
    /// Returns the first write-back error; remaining pages are still attempted.
    pub fn flush_all(&self) -> Result<usize> {
        let written = self.flush_matching(|_| true)?;
        self.store.lock().sync()?;
        Ok(written)
    }

    /// Writes back dirty frames nobody has pinned. Never evicts.
    ///
    /// Returns the number of pages written.
    ///
    /// # Errors
    ///
    /// Returns the first write-back error; remaining pages are still attempted.
    pub fn flush_unpinned(&self) -> Result<usize> {
        self.flush_matching(|frame| frame.pin_count() == 0)
    }

    fn flush_matching(&self, select: impl Fn(&BufferFrame) -> bool) -> Result<usize> {
        let mut targets = Vec::new();
        {
            let state = self.state.lock();
            for &idx in state.page_table.values() {
                let frame = &self.frames[idx];
                if frame.is_dirty() && select(frame) {
                    frame.pin();
                    targets.push(idx);
                }
            }
        }

        let mut written = 0;
        let mut first_error = None;
        for idx in targets {
            match self.write_back(idx) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
            self.frames[idx].try_unpin();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Syncs the data file.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.store.lock().sync()
    }

    /// Snapshots `(page, rec_lsn)` for every dirty resident page.
    ///
    /// Each frame latch is taken briefly, so an update in progress is either
    /// fully visible here or has not logged its record yet.
    #[must_use]
    pub fn dirty_page_table(&self) -> Vec<DirtyPageEntry> {
        self.frames
            .iter()
            .filter_map(|frame| {
                let page = frame.page().read();
                frame.rec_lsn().map(|rec_lsn| DirtyPageEntry {
                    page_id: page.id,
                    rec_lsn,
                })
            })
            .collect()
    }

    /// Returns whether any frame holds unwritten changes. Takes no latches.
    #[must_use]
    pub fn has_dirty_pages(&self) -> bool {
        self.frames.iter().any(BufferFrame::is_dirty)
    }

    /// Pins a resident page under the pool lock.
    fn pin_resident(&self, page_id: PageId, touch: bool) -> Option<usize> {
        let mut state = self.state.lock();
        let idx = *state.page_table.get(&page_id)?;
        self.frames[idx].pin();
        if touch {
            state.replacer.touch(idx);
        }
        Some(idx)
    }

    /// Produces a page under the store lock and installs it in a frame.
    ///
    /// Holding the store lock across produce and install keeps a concurrent
    /// write-back from landing between the two and leaving a stale copy cached.
    fn load(&self, mut produce: impl FnMut(&mut PageStore) -> Result<Page>) -> Result<usize> {
        let attempts = self.frames.len() + 8;
        for _ in 0..attempts {
            let mut store = self.store.lock();
            let page = produce(&mut *store)?;
            let mut state = self.state.lock();

            match self.place(&mut state, page)? {
                Placement::Ready(idx) => return Ok(idx),
                Placement::WriteBack(victim) => {
                    drop(state);
                    drop(store);
                    let result = self.write_back(victim);
                    self.frames[victim].try_unpin();
                    result?;
                }
            }
        }

        warn!(
            capacity = self.frames.len(),
            "gave up finding a clean victim; pages are being re-dirtied faster than they flush"
        );
        Err(StorageError::PoolExhausted {
            capacity: self.frames.len(),
        })
    }

    /// Installs `page` in a free frame or the LRU victim, pinning it.
    fn place(&self, state: &mut PoolState, page: Page) -> Result<Placement> {
        let page_id = page.id;

        // Someone else loaded it while we were reading.
        if let Some(&idx) = state.page_table.get(&page_id) {
            self.frames[idx].pin();
            state.replacer.touch(idx);
            return Ok(Placement::Ready(idx));
        }

        let idx = if let Some(idx) = state.free_list.pop() {
            idx
        } else {
            let victim = state
                .replacer
                .candidates()
                .find(|&idx| self.frames[idx].pin_count() == 0)
                .ok_or(StorageError::PoolExhausted {
                    capacity: self.frames.len(),
                })?;

            let frame = &self.frames[victim];
            if frame.is_dirty() {
                frame.pin();
                return Ok(Placement::WriteBack(victim));
            }

            let old_id = frame.page().read().id;
            state.page_table.remove(&old_id);
            state.replacer.remove(victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(evicted = %old_id, loaded = %page_id, frame = victim, "evicted page");
            victim
        };

        let frame = &self.frames[idx];
        frame.reset(page);
        frame.pin();
        state.page_table.insert(page_id, idx);
        state.replacer.touch(idx);
        Ok(Placement::Ready(idx))
    }

    /// Writes a pinned frame back if it is dirty, honoring the write-ahead rule.
    ///
    /// Returns whether a write happened.
    fn write_back(&self, frame_idx: usize) -> Result<bool> {
        let frame = &self.frames[frame_idx];
        let page = frame.page().read();
        if !frame.is_dirty() {
            return Ok(false);
        }
        if self.is_read_only() {
            return Err(StorageError::ReadOnly(format!(
                "cannot write back {} after repeated I/O failures",
                page.id
            )));
        }

        // Stays dirty until the write lands, so checkpoints and log
        // truncation keep seeing the page while the log is being forced.
        match self.write_page_logged(&page) {
            Ok(()) => {
                frame.clear_dirty();
                self.io_failures.store(0, Ordering::Relaxed);
                self.pages_flushed.fetch_add(1, Ordering::Relaxed);
                trace!(page_id = %page.id, page_lsn = page.lsn(), "wrote back page");
                Ok(true)
            }
            Err(e) => {
                if matches!(e, StorageError::IoError(_)) {
                    self.record_io_failure(&e);
                }
                Err(e)
            }
        }
    }

    fn write_page_logged(&self, page: &Page) -> Result<()> {
        let page_lsn = page.lsn();
        if page_lsn > self.log.durable_lsn() {
            self.log.flush_up_to(page_lsn)?;
            let durable_lsn = self.log.durable_lsn();
            if page_lsn > durable_lsn {
                error!(page_id = %page.id, page_lsn, durable_lsn, "refusing to write page ahead of the log");
                return Err(StorageError::WriteAheadViolation {
                    page_id: page.id,
                    page_lsn,
                    durable_lsn,
                });
            }
        }

        self.store.lock().write_page(page, self.sync_writes)
    }

    fn record_io_failure(&self, err: &StorageError) {
        let failures = self.io_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(failures, error = %err, "page write-back failed");
        if failures >= self.io_error_threshold && !self.read_only.swap(true, Ordering::AcqRel) {
            error!(
                failures,
                "buffer pool switching to read-only after repeated I/O failures"
            );
        }
    }

    /// Returns buffer pool statistics.
    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        let mut dirty_count = 0;
        let mut pinned_count = 0;

        for &idx in state.page_table.values() {
            let frame = &self.frames[idx];
            if frame.is_dirty() {
                dirty_count += 1;
            }
            if frame.pin_count() > 0 {
                pinned_count += 1;
            }
        }

        BufferPoolStats {
            capacity: self.frames.len(),
            pages_used: state.page_table.len(),
            dirty_pages: dirty_count,
            pinned_pages: pinned_count,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            read_only: self.is_read_only(),
        }
    }

    /// Resets the cache statistics counters.
    ///
    /// This is useful for benchmarking or monitoring specific workloads.
    pub fn reset_stats(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.pages_flushed.store(0, Ordering::Relaxed);
    }
}

/// A pinned frame returned by [`BufferPool::fetch_page`].
///
/// Holds one pin until [`unpin`](Self::unpin) is called. Dropping it without
/// unpinning leaks the pin.
#[must_use = "a fetched frame stays pinned until unpinned"]
pub struct FrameRef<'a> {
    pool: &'a BufferPool,
    frame_idx: usize,
    page_id: PageId,
}

impl FrameRef<'_> {
    /// Returns the page ID.
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Takes the frame's read latch.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frames[self.frame_idx].page().read()
    }

    /// Takes the frame's write latch. Mutating through the guard marks the
    /// frame dirty when it drops.
    pub fn write(&self) -> PageWriteGuard<'_> {
        let frame = &self.pool.frames[self.frame_idx];
        PageWriteGuard {
            frame,
            guard: frame.page().write(),
            modified: false,
        }
    }

    /// Releases the pin.
    ///
    /// # Errors
    ///
    /// Returns `NotPinned` if the pin was already released elsewhere.
    pub fn unpin(self, is_dirty: bool) -> Result<()> {
        self.pool
            .unpin_frame(self.frame_idx, self.page_id, is_dirty)
    }
}

/// RAII guard for a pinned page.
///
/// Automatically unpins the page when dropped.
pub struct PageHandle<'a> {
    frame: FrameRef<'a>,
}

impl PageHandle<'_> {
    /// Returns the page ID.
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.frame.page_id
    }

    /// Takes the frame's read latch.
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.read()
    }

    /// Takes the frame's write latch.
    pub fn write(&self) -> PageWriteGuard<'_> {
        self.frame.write()
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.frame.pool.frames[self.frame.frame_idx].try_unpin();
    }
}

/// Exclusive access to a pinned page's bytes.
///
/// If the page was mutated, the frame is marked dirty on drop with the page's
/// LSN as its recovery LSN, while the latch is still held.
pub struct PageWriteGuard<'a> {
    frame: &'a BufferFrame,
    guard: RwLockWriteGuard<'a, Page>,
    modified: bool,
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        self.modified = true;
        &mut self.guard
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        if self.modified {
            self.frame.mark_dirty(self.guard.lsn());
        }
    }
}

/// Statistics about the buffer pool state.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Maximum number of pages the pool can hold.
    pub capacity: usize,
    /// Current number of pages in the pool.
    pub pages_used: usize,
    /// Number of dirty pages.
    pub dirty_pages: usize,
    /// Number of pinned pages.
    pub pinned_pages: usize,
    /// Number of cache hits (page found in buffer pool).
    pub cache_hits: u64,
    /// Number of cache misses (page had to be loaded from disk).
    pub cache_misses: u64,
    /// Number of pages evicted.
    pub evictions: u64,
    /// Number of page write-backs.
    pub pages_flushed: u64,
    /// Whether the pool refuses writes.
    pub read_only: bool,
}

impl BufferPoolStats {
    /// Calculates the cache hit rate as a percentage (0.0 to 1.0).
    ///
    /// Returns `None` if there have been no cache accesses.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            None
        } else {
            Some(self.cache_hits as f64 / total as f64)
        }
    }

    /// Returns the total number of cache accesses (hits + misses).
    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        self.cache_hits + self.cache_misses
    }
}
