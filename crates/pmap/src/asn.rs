//! Address space number allocation.
//!
//! Each processor hands out ASNs sequentially within a generation. When it runs out it
//! flushes every non-global translation, starts over at 1 and bumps the generation, which
//! invalidates every ASN any address space held on that processor at once.

use alloc::boxed::Box;

use crate::{CpuId, Mmu, pmap::{Level1, Pmap}};

/// The ASN used by address spaces on the kernel template. Translations reached through
/// the template are address-space-match, so the tag is never consulted.
pub const ASN_RESERVED: u32 = 0;

/// A generation no processor is ever in. Storing it forces a fresh ASN on next use.
pub const GENERATION_INVALID: u64 = 0;

#[derive(Debug, Clone, Copy)]
struct CpuAsnState {
    next: u32,
    generation: u64,
}

/// Per-processor ASN state.
pub struct AsnAllocator {
    max_asn: u32,
    cpus: Box<[spin::Mutex<CpuAsnState>]>,
}

impl AsnAllocator {
    pub fn new(cpu_count: usize, max_asn: u32) -> Self {
        Self {
            max_asn,
            cpus: (0..cpu_count)
                .map(|_| {
                    spin::Mutex::new(CpuAsnState {
                        next: 1,
                        generation: 1,
                    })
                })
                .collect(),
        }
    }

    pub fn max_asn(&self) -> u32 {
        self.max_asn
    }

    /// Current generation of `cpu`.
    pub fn generation(&self, cpu: CpuId) -> u64 {
        self.cpus[cpu].lock().generation
    }

    /// Returns true if `pmap` holds an ASN from the current generation of `cpu`.
    pub fn is_current(&self, pmap: &Pmap, cpu: CpuId) -> bool {
        pmap.asn(cpu).1 == self.generation(cpu)
    }

    /// Makes sure `pmap` has a usable ASN on `cpu` and returns it.
    ///
    /// Must run on `cpu` with the address space locked, since exhausting the ASNs flushes
    /// the local TLB.
    pub(crate) fn assign(&self, mmu: &dyn Mmu, pmap: &Pmap, level1: Level1, cpu: CpuId) -> u32 {
        debug_assert_eq!(cpu, mmu.current_cpu());

        if level1 == Level1::SharedTemplate {
            let (asn, _) = pmap.asn(cpu);
            assert_eq!(
                asn, ASN_RESERVED,
                "address space on the kernel template holds ASN {asn}"
            );
            return ASN_RESERVED;
        }

        let mut state = self.cpus[cpu].lock();

        if self.max_asn == 0 {
            // Untagged TLB: every context switch flushes. Keep the generation current so
            // the shootdown bookkeeping treats the address space as cached here.
            pmap.set_asn(cpu, ASN_RESERVED, state.generation);
            return ASN_RESERVED;
        }

        let (asn, generation) = pmap.asn(cpu);
        if asn != ASN_RESERVED && generation == state.generation {
            return asn;
        }

        if state.next > self.max_asn {
            mmu.invalidate_user();
            mmu.sync_icache();
            state.next = 1;
            state.generation = state.generation.wrapping_add(1);
            assert_ne!(
                state.generation, GENERATION_INVALID,
                "ASN generation wrapped"
            );
            log::debug!("cpu {cpu}: ASN generation {}", state.generation);
        }

        let asn = state.next;
        state.next += 1;
        pmap.set_asn(cpu, asn, state.generation);
        // A fresh ASN cannot have stale instructions behind it.
        pmap.needs_isync.remove(cpu);
        log::trace!("cpu {cpu}: pmap {} gets ASN {asn}", pmap.id());
        asn
    }
}
