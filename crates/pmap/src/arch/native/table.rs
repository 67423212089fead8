//! Page table page.

use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{ENTRIES_PER_TABLE, entry::PageEntry};

/// One page of page table entries, as seen through the direct map.
///
/// The table is only ever reached by reference into physical memory. Entries are atomics
/// because the hardware walker reads them concurrently with the lock holder writing them.
#[repr(transparent)]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    #[inline]
    pub fn entry(&self, index: usize) -> PageEntry {
        PageEntry::from_u64(self.entries[index].load(Ordering::Acquire))
    }

    /// Stores an entry at the given index.
    #[inline]
    pub fn set_entry(&self, index: usize, entry: PageEntry) {
        self.entries[index].store(entry.as_u64(), Ordering::Release);
    }

    /// Invalidates the entry at the given index, returning what was there.
    #[inline]
    pub fn clear_entry(&self, index: usize) -> PageEntry {
        PageEntry::from_u64(self.entries[index].swap(0, Ordering::AcqRel))
    }

    /// Zeroes every entry.
    pub fn clear(&self) {
        for entry in &self.entries {
            entry.store(0, Ordering::Relaxed);
        }
        core::sync::atomic::fence(Ordering::Release);
    }

    /// Copies the entries in `range` from another table.
    pub fn copy_from(&self, source: &PageTable, range: Range<usize>) {
        for index in range {
            self.set_entry(index, source.entry(index));
        }
    }

    /// Iterates over the valid entries in `range` with their indices.
    pub fn valid_entries(&self, range: Range<usize>) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        range
            .map(|index| (index, self.entry(index)))
            .filter(|(_, entry)| entry.is_valid())
    }

    /// Returns the number of entries in a page table.
    pub const fn len(&self) -> usize {
        ENTRIES_PER_TABLE
    }
}
