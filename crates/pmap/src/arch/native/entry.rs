//! Page table entry.

use core::fmt;

use crate::{FrameNumber, PhysicalAddress};

use super::{PAGE_SHIFT, flags::PageFlags};

/// A single 64-bit page table entry.
///
/// The entry format:
/// - Bits 0-31: Flags (see [`PageFlags`])
/// - Bits 32-63: Page frame number
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    const PFN_SHIFT: u32 = 32;
    const FLAGS_MASK: u64 = 0xFFFF_FFFF;

    /// An invalid entry.
    pub const EMPTY: Self = Self(0);

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(super::PAGE_SIZE),
            "physical address must be page-aligned"
        );
        let pfn = (address.as_usize() >> PAGE_SHIFT) as u64;
        Self((pfn << Self::PFN_SHIFT) | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns the physical address of the frame this entry points at.
    #[inline]
    pub fn address(self) -> PhysicalAddress {
        self.frame().start()
    }

    #[inline]
    pub fn frame(self) -> FrameNumber {
        FrameNumber::new((self.0 >> Self::PFN_SHIFT) as usize)
    }

    #[inline]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    /// Returns a copy of this entry with its flags replaced.
    #[inline]
    pub const fn with_flags(self, flags: PageFlags) -> Self {
        Self((self.0 & !Self::FLAGS_MASK) | (flags.bits() & Self::FLAGS_MASK))
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.flags().is_valid()
    }

    #[inline]
    pub const fn is_wired(self) -> bool {
        self.flags().is_wired()
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "PageEntry({}, {:?})", self.address(), self.flags())
        } else {
            write!(f, "PageEntry(invalid, {:#x})", self.0)
        }
    }
}
