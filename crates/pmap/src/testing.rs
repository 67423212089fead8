//! An emulated machine for tests.

use alloc::sync::Arc;

use crate::{
    Bootstrap, DirectMap, EmulatedFrameAllocator, EmulatedMmu, PhysicalAddress, PmapConfig,
    PmapSystem, VirtualAddress, arch::PAGE_SIZE,
};

const MIB: usize = 1024 * 1024;

/// Emulated physical memory: data pages below 1 MiB, frames for the allocator up to 2 MiB,
/// boot-time memory above that. Everything below 2 MiB is managed.
pub(crate) const MEMORY_SIZE: usize = 4 * MIB;

pub(crate) struct TestMachine {
    pub(crate) sys: PmapSystem,
    pub(crate) mmu: Arc<EmulatedMmu>,
    pub(crate) frames: Arc<EmulatedFrameAllocator>,
}

impl TestMachine {
    pub(crate) fn new(cpus: usize, max_asn: u32) -> Self {
        Self::with_config(cpus, max_asn, PmapConfig::default())
    }

    pub(crate) fn with_config(cpus: usize, max_asn: u32, config: PmapConfig) -> Self {
        EmulatedMmu::set_current_cpu(0);
        let mmu = Arc::new(EmulatedMmu::new(cpus, max_asn));
        let boot = Bootstrap::new(
            config,
            DirectMap::emulated(MEMORY_SIZE),
            mmu.clone(),
            PhysicalAddress::new(2 * MIB)..PhysicalAddress::new(MEMORY_SIZE),
        );
        let frames = Arc::new(EmulatedFrameAllocator::new(
            PhysicalAddress::new(MIB)..PhysicalAddress::new(2 * MIB),
        ));
        let sys = boot.finish(
            frames.clone(),
            PhysicalAddress::new(0)..PhysicalAddress::new(2 * MIB),
        );
        Self { sys, mmu, frames }
    }

    /// Runs the rest of the calling thread as `cpu`.
    pub(crate) fn on_cpu(&self, cpu: usize) {
        EmulatedMmu::set_current_cpu(cpu);
    }

    /// Translates `va` on the current processor through its TLB and loaded tables.
    pub(crate) fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.mmu.translate(self.sys.memory(), va)
    }
}

/// A managed data page. `n` is below 255.
pub(crate) fn data_page(n: usize) -> PhysicalAddress {
    PhysicalAddress::new((n + 1) * PAGE_SIZE)
}

/// A page outside the managed range.
pub(crate) fn unmanaged_page(n: usize) -> PhysicalAddress {
    PhysicalAddress::new(MEMORY_SIZE - (n + 1) * PAGE_SIZE)
}

pub(crate) fn va(address: usize) -> VirtualAddress {
    VirtualAddress::new(address)
}
