//! Page identifier type.

use serde::{Deserialize, Serialize};

/// Identifier of a page in the data file.
///
/// Page `i` lives at byte offset `i * PAGE_SIZE`. There is a single data file,
/// so the ID is just the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Creates a new page ID.
    #[must_use]
    pub const fn new(page_idx: u32) -> Self {
        Self(page_idx)
    }

    /// Returns the slot index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.0
    }

    /// Returns the byte offset of this page within the data file.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.0 as u64) * (super::PAGE_SIZE as u64)
    }

    /// Returns the next page ID.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({})", self.0)
    }
}
