//! LRU replacer for the buffer pool.
//!
//! Every resident frame carries a recency stamp from a monotonic clock.
//! Victim selection walks frames oldest first; the pool skips pinned ones.

use std::collections::BTreeMap;

/// Tracks access recency of resident frames.
///
/// Touch and remove are `O(log n)`; candidates are produced in
/// least-recently-used order.
#[derive(Debug)]
pub struct LruReplacer {
    /// Recency stamp to frame index, oldest first.
    order: BTreeMap<u64, usize>,
    /// Current stamp of each frame, if resident.
    stamps: Vec<Option<u64>>,
    /// Monotonically increasing access counter.
    clock: u64,
}

impl LruReplacer {
    /// Creates a replacer for `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: BTreeMap::new(),
            stamps: vec![None; capacity],
            clock: 0,
        }
    }

    /// Records an access to a frame, making it the most recently used.
    pub fn touch(&mut self, frame_idx: usize) {
        if let Some(old) = self.stamps[frame_idx].take() {
            self.order.remove(&old);
        }
        self.clock += 1;
        self.order.insert(self.clock, frame_idx);
        self.stamps[frame_idx] = Some(self.clock);
    }

    /// Stops tracking a frame (its page was evicted).
    pub fn remove(&mut self, frame_idx: usize) {
        if let Some(old) = self.stamps[frame_idx].take() {
            self.order.remove(&old);
        }
    }

    /// Returns tracked frame indices in eviction order (oldest first).
    pub fn candidates(&self) -> impl Iterator<Item = usize> + '_ {
        self.order.values().copied()
    }

    /// Returns the number of tracked frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns whether no frames are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Clears all entries.
    pub fn clear(&mut self) {
        self.order.clear();
        self.stamps.iter_mut().for_each(|stamp| *stamp = None);
    }
}
