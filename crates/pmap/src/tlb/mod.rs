//! TLB consistency.
//!
//! Every change to a valid leaf entry goes through a [`TlbBatch`]. The batch invalidates the
//! local TLB immediately and, on multiprocessor builds, queues a job for each remote
//! processor that may cache the old translation. The remote processors are signalled when
//! the batch is dropped, before the operation that created it returns.

#[cfg(feature = "multiprocessor")]
mod shootdown;

use alloc::sync::Arc;

#[cfg(feature = "multiprocessor")]
pub use shootdown::ShootdownQueues;
#[cfg(feature = "multiprocessor")]
use shootdown::ShootdownJob;

use crate::{
    CpuId, Mmu, VirtualAddress,
    arch::PageEntry,
    asn::{ASN_RESERVED, AsnAllocator},
    pmap::Pmap,
};

#[cfg(feature = "multiprocessor")]
use crate::{CpuMask, Ipi, asn::GENERATION_INVALID};

/// Invalidates one translation on the executing processor.
///
/// A global entry is dropped under every ASN. Otherwise, if the address space is not
/// active here, forgetting its ASN is enough: the next activation draws a fresh one and
/// the stale entries can never match again.
pub(crate) fn invalidate_local(
    mmu: &dyn Mmu,
    cpu: CpuId,
    pmap: &Pmap,
    va: VirtualAddress,
    pte: PageEntry,
) {
    if pte.flags().is_global() {
        mmu.invalidate_page(va, ASN_RESERVED, true);
    } else if pmap.is_active_on(cpu) {
        mmu.invalidate_page(va, pmap.asn(cpu).0, false);
    } else {
        pmap.invalidate_asn(cpu);
    }
}

/// The TLB work of one mapping operation.
///
/// The batch needs to stick to the processor that created it.
pub(crate) struct TlbBatch<'a> {
    mmu: &'a dyn Mmu,
    #[cfg_attr(not(feature = "multiprocessor"), allow(dead_code))]
    asns: &'a AsnAllocator,
    cpu: CpuId,
    #[cfg(feature = "multiprocessor")]
    queues: &'a ShootdownQueues,
    /// Processors with newly queued work.
    #[cfg(feature = "multiprocessor")]
    signal: CpuMask,
}

impl<'a> TlbBatch<'a> {
    #[cfg(feature = "multiprocessor")]
    pub(crate) fn new(mmu: &'a dyn Mmu, asns: &'a AsnAllocator, queues: &'a ShootdownQueues) -> Self {
        Self {
            mmu,
            asns,
            cpu: mmu.current_cpu(),
            queues,
            signal: CpuMask::EMPTY,
        }
    }

    #[cfg(not(feature = "multiprocessor"))]
    pub(crate) fn new(mmu: &'a dyn Mmu, asns: &'a AsnAllocator) -> Self {
        Self {
            mmu,
            asns,
            cpu: mmu.current_cpu(),
        }
    }

    /// The processor this batch runs on.
    pub(crate) fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Makes every processor drop its cached copy of `pte`, the previous value of the
    /// entry mapping `va` in `pmap`.
    pub(crate) fn invalidate(&mut self, pmap: &Arc<Pmap>, va: VirtualAddress, pte: PageEntry) {
        invalidate_local(self.mmu, self.cpu, pmap, va, pte);

        #[cfg(feature = "multiprocessor")]
        {
            let targets = self.remote_targets(pmap, pte);
            for cpu in targets.iter() {
                self.queues.push(
                    cpu,
                    ShootdownJob::Invalidate {
                        pmap: pmap.clone(),
                        va,
                        pte,
                    },
                );
            }
            self.signal = self.signal.union(targets);
        }
    }

    /// Makes remote processors running `pmap` reload its context, because its level-1
    /// table has changed.
    #[cfg(feature = "multiprocessor")]
    pub(crate) fn reload(&mut self, pmap: &Arc<Pmap>) {
        let targets = pmap.active.load().without(self.cpu);
        for cpu in targets.iter() {
            self.queues.push(cpu, ShootdownJob::Reload { pmap: pmap.clone() });
        }
        self.signal = self.signal.union(targets);
    }

    #[cfg(not(feature = "multiprocessor"))]
    pub(crate) fn reload(&mut self, _pmap: &Arc<Pmap>) {}

    /// Remote processors that may hold a cached copy of `pte`.
    #[cfg(feature = "multiprocessor")]
    fn remote_targets(&self, pmap: &Pmap, pte: PageEntry) -> CpuMask {
        let others = CpuMask::first(self.mmu.cpu_count()).without(self.cpu);
        if pte.flags().is_global() {
            return others;
        }
        if self.asns.max_asn() == 0 {
            // Untagged TLBs lose everything not global when they switch away.
            return pmap.active.load().without(self.cpu);
        }
        others
            .iter()
            .filter(|&cpu| pmap.is_active_on(cpu) || pmap.asn(cpu).1 != GENERATION_INVALID)
            .fold(CpuMask::EMPTY, CpuMask::with)
    }

    #[cfg(feature = "multiprocessor")]
    fn dispatch(&mut self) {
        for cpu in self.signal.iter() {
            self.mmu.send_ipi(cpu, Ipi::Shootdown);
        }
        self.signal = CpuMask::EMPTY;
    }
}

impl Drop for TlbBatch<'_> {
    fn drop(&mut self) {
        #[cfg(feature = "multiprocessor")]
        self.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmulatedMmu, PhysicalAddress, arch::PageFlags, pmap::Level1};

    fn entry(flags: PageFlags) -> PageEntry {
        PageEntry::new(PhysicalAddress::new(0x5000), PageFlags::VALID | flags)
    }

    #[test]
    fn inactive_pmap_loses_asn() {
        EmulatedMmu::set_current_cpu(0);
        let mmu = EmulatedMmu::new(1, 63);
        let pmap = Pmap::new(1, false, Level1::Private(PhysicalAddress::new(0x1000)), 1);
        pmap.set_asn(0, 4, 1);
        invalidate_local(&mmu, 0, &pmap, VirtualAddress::new(0x2000), entry(PageFlags::USER_READ));
        assert_eq!(pmap.asn(0), (4, crate::asn::GENERATION_INVALID));
        assert_eq!(mmu.counters(0).single, 0);
    }

    #[test]
    fn active_pmap_invalidates_page() {
        EmulatedMmu::set_current_cpu(0);
        let mmu = EmulatedMmu::new(1, 63);
        let pmap = Pmap::new(1, false, Level1::Private(PhysicalAddress::new(0x1000)), 1);
        pmap.set_asn(0, 4, 1);
        pmap.active.insert(0);
        invalidate_local(&mmu, 0, &pmap, VirtualAddress::new(0x2000), entry(PageFlags::USER_READ));
        assert_eq!(pmap.asn(0), (4, 1));
        assert_eq!(mmu.counters(0).single, 1);
    }

    #[test]
    fn global_entry_always_invalidates() {
        EmulatedMmu::set_current_cpu(0);
        let mmu = EmulatedMmu::new(1, 63);
        let pmap = Pmap::new(0, true, Level1::SharedTemplate, 1);
        invalidate_local(
            &mmu,
            0,
            &pmap,
            VirtualAddress::new(crate::arch::VM_MIN_KERNEL_ADDRESS),
            entry(PageFlags::ADDRESS_SPACE_MATCH | PageFlags::KERNEL_READ),
        );
        assert_eq!(mmu.counters(0).single, 1);
    }
}
