//! Software emulation of the machine for testing and development.
//!
//! This module provides an emulated machine that can run on any host:
//! - [`EmulatedMemory`]: physical memory backed by a buffer of 64-bit words
//! - [`EmulatedMmu`]: processors with software TLBs, a table walker and pending IPIs
//! - [`EmulatedFrameAllocator`]: a frame allocator with a settable limit
//!
//! The emulated machine uses the native geometry unchanged, so every page table built
//! here has the exact layout the hardware would walk.

mod frames;
mod mmu;

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;

pub use frames::EmulatedFrameAllocator;
pub use mmu::{EmulatedMmu, TlbCounters};

use super::{ENTRIES_PER_TABLE, PAGE_SIZE, PageTable};
use crate::PhysicalAddress;

const WORD_SIZE: usize = core::mem::size_of::<u64>();

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space for building and walking page tables
/// without requiring actual hardware or virtual memory support from the host OS. Memory
/// is held as atomics so that emulated processors can walk tables while another thread
/// updates them.
pub struct EmulatedMemory {
    /// The underlying memory, one atomic per 64-bit word.
    words: Box<[AtomicU64]>,
}

impl EmulatedMemory {
    /// Creates a new, zeroed emulated memory region of the specified size.
    ///
    /// # Panics
    /// Panics if `size` is not a multiple of the page size.
    pub fn new(size: usize) -> Self {
        assert!(
            size % PAGE_SIZE == 0,
            "emulated memory size must be a multiple of the page size"
        );
        Self {
            words: (0..size / WORD_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.words.len() * WORD_SIZE
    }

    /// Returns the page at `phys` viewed as a page table.
    ///
    /// # Panics
    /// Panics if the address is not page-aligned or lies outside the emulated memory.
    pub fn table(&self, phys: PhysicalAddress) -> &PageTable {
        assert!(
            phys.is_aligned(PAGE_SIZE),
            "page table address must be page-aligned"
        );
        let start = phys.as_usize() / WORD_SIZE;
        let words = &self.words[start..start + ENTRIES_PER_TABLE];
        // SAFETY: PageTable is a transparent wrapper around [AtomicU64; ENTRIES_PER_TABLE]
        // and `words` is exactly that many contiguous, initialized atomics.
        unsafe { &*(words.as_ptr() as *const PageTable) }
    }

    /// Reads one word of emulated memory.
    pub fn read_u64(&self, phys: PhysicalAddress) -> u64 {
        debug_assert!(phys.is_aligned(WORD_SIZE));
        self.words[phys.as_usize() / WORD_SIZE].load(Ordering::Acquire)
    }

    /// Writes one word of emulated memory.
    pub fn write_u64(&self, phys: PhysicalAddress, value: u64) {
        debug_assert!(phys.is_aligned(WORD_SIZE));
        self.words[phys.as_usize() / WORD_SIZE].store(value, Ordering::Release);
    }
}
