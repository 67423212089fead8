//! Access to physical memory.
//!
//! Page tables live in physical pages. The layer reaches them through the direct-mapped
//! segment on hardware, or through an emulated memory buffer when testing.

use crate::{
    PhysicalAddress, VirtualAddress,
    arch::{self, PageTable},
};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Translator from physical pages to something the layer can read and write.
///
/// This enum supports two modes:
/// - Hardware: physical memory is visible at a fixed offset (K0SEG)
/// - Emulated: physical memory is an emulated buffer (testing mode)
pub enum DirectMap {
    /// Hardware translation through the direct-mapped segment.
    Hardware { offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl DirectMap {
    /// Creates a hardware translator using the architectural K0SEG base.
    pub const fn hardware() -> Self {
        Self::Hardware {
            offset: arch::K0SEG_BASE,
        }
    }

    /// Creates an emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Returns the virtual address through which `phys` is reached.
    ///
    /// Emulated memory reports the architectural K0SEG address as well, so callers see
    /// the same addresses in both modes.
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        match self {
            Self::Hardware { offset } => VirtualAddress::new(phys.as_usize() + offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(_) => phys.to_k0seg(),
        }
    }

    /// Translates a direct-mapped virtual address back to a physical address.
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> PhysicalAddress {
        match self {
            Self::Hardware { offset } => PhysicalAddress::new(virt.as_usize() - offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(_) => virt.k0seg_to_physical(),
        }
    }

    /// Returns the page at `phys` viewed as a page table.
    ///
    /// The caller must hold whatever lock owns that page; the view itself only provides
    /// atomic entry access.
    pub fn table(&self, phys: PhysicalAddress) -> &PageTable {
        debug_assert!(phys.is_aligned(arch::PAGE_SIZE));
        match self {
            Self::Hardware { offset } => {
                let ptr = (phys.as_usize() + offset) as *const PageTable;
                // SAFETY: on hardware every physical page is mapped at `offset` for the
                // lifetime of the kernel, and a page is exactly one table of atomics.
                unsafe { &*ptr }
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.table(phys),
        }
    }

    /// Fills a page with zeroes.
    pub fn zero_page(&self, phys: PhysicalAddress) {
        self.table(phys).clear();
    }

    /// Copies the contents of one page to another.
    pub fn copy_page(&self, source: PhysicalAddress, destination: PhysicalAddress) {
        let source = self.table(source);
        self.table(destination)
            .copy_from(source, 0..arch::ENTRIES_PER_TABLE);
    }

    /// Returns the emulated memory, if this translator is emulated.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated_memory(&self) -> Option<&EmulatedMemory> {
        match self {
            Self::Hardware { .. } => None,
            Self::Emulated(memory) => Some(memory),
        }
    }
}
