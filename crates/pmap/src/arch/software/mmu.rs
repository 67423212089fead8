//! Emulated processors with software TLBs.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::{boxed::Box, vec::Vec};

use crate::{
    CpuId, DirectMap, Ipi, Mmu, PageNumber, PhysicalAddress, VirtualAddress,
    arch::{PAGE_TABLE_LEVELS, PageEntry, page_index},
};

std::thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
}

/// One cached translation.
#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    page: PageNumber,
    asn: u32,
    global: bool,
    leaf: PageEntry,
}

/// Invalidation counters for one processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbCounters {
    pub single: usize,
    pub user: usize,
    pub all: usize,
    pub icache: usize,
    pub context_loads: usize,
}

#[derive(Default)]
struct AtomicCounters {
    single: AtomicUsize,
    user: AtomicUsize,
    all: AtomicUsize,
    icache: AtomicUsize,
    context_loads: AtomicUsize,
}

#[derive(Default)]
struct EmulatedCpu {
    context: spin::Mutex<Option<(PhysicalAddress, u32)>>,
    tlb: spin::Mutex<Vec<TlbEntry>>,
    pending: spin::Mutex<Vec<Ipi>>,
    counters: AtomicCounters,
}

/// Emulated multiprocessor MMU.
///
/// The processor executing a call is the calling thread's current CPU, set with
/// [`EmulatedMmu::set_current_cpu`]. Each processor keeps a software TLB that is only
/// filled by [`EmulatedMmu::translate`] and only emptied by the invalidation operations,
/// so a test can observe exactly which stale translations survive.
pub struct EmulatedMmu {
    max_asn: u32,
    cpus: Box<[EmulatedCpu]>,
}

impl EmulatedMmu {
    /// Creates `cpu_count` processors supporting ASNs up to `max_asn` (0 for an untagged TLB).
    pub fn new(cpu_count: usize, max_asn: u32) -> Self {
        assert!(
            cpu_count > 0 && cpu_count <= crate::MAX_CPUS,
            "unsupported processor count"
        );
        Self {
            max_asn,
            cpus: (0..cpu_count).map(|_| EmulatedCpu::default()).collect(),
        }
    }

    /// Makes `cpu` the processor executing on the calling thread.
    pub fn set_current_cpu(cpu: CpuId) {
        CURRENT_CPU.with(|current| current.set(cpu));
    }

    fn cpu(&self) -> &EmulatedCpu {
        &self.cpus[self.current_cpu()]
    }

    /// Translates `va` on the current processor the way the hardware would: a TLB hit
    /// wins, otherwise the loaded level-1 table is walked and a valid leaf is cached.
    ///
    /// Reference/modify emulation bits are ignored; they only matter to the fault path.
    pub fn translate(&self, memory: &DirectMap, va: VirtualAddress) -> Option<PhysicalAddress> {
        let cpu = self.cpu();
        let (level1, asn) = (*cpu.context.lock())?;
        let page = va.page_number();

        let hit = cpu
            .tlb
            .lock()
            .iter()
            .find(|entry| entry.page == page && (entry.global || entry.asn == asn))
            .map(|entry| entry.leaf);
        if let Some(leaf) = hit {
            return Some(leaf.address() + va.page_offset());
        }

        let mut table = level1;
        for level in 1..PAGE_TABLE_LEVELS {
            let entry = memory.table(table).entry(page_index(va.as_usize(), level));
            if !entry.is_valid() {
                return None;
            }
            table = entry.address();
        }
        let leaf = memory
            .table(table)
            .entry(page_index(va.as_usize(), PAGE_TABLE_LEVELS));
        if !leaf.is_valid() {
            return None;
        }

        cpu.tlb.lock().push(TlbEntry {
            page,
            asn,
            global: leaf.flags().is_global(),
            leaf,
        });
        Some(leaf.address() + va.page_offset())
    }

    /// Returns true if `cpu` holds a cached translation for `va` usable under `asn`.
    pub fn is_cached(&self, cpu: CpuId, va: VirtualAddress, asn: u32) -> bool {
        let page = va.page_number();
        self.cpus[cpu]
            .tlb
            .lock()
            .iter()
            .any(|entry| entry.page == page && (entry.global || entry.asn == asn))
    }

    /// Number of cached translations on `cpu`.
    pub fn tlb_len(&self, cpu: CpuId) -> usize {
        self.cpus[cpu].tlb.lock().len()
    }

    /// Level-1 table and ASN loaded on `cpu`.
    pub fn context(&self, cpu: CpuId) -> Option<(PhysicalAddress, u32)> {
        *self.cpus[cpu].context.lock()
    }

    pub fn counters(&self, cpu: CpuId) -> TlbCounters {
        let counters = &self.cpus[cpu].counters;
        TlbCounters {
            single: counters.single.load(Ordering::Relaxed),
            user: counters.user.load(Ordering::Relaxed),
            all: counters.all.load(Ordering::Relaxed),
            icache: counters.icache.load(Ordering::Relaxed),
            context_loads: counters.context_loads.load(Ordering::Relaxed),
        }
    }

    /// Takes the interrupts delivered to `cpu` since the last call.
    pub fn take_ipis(&self, cpu: CpuId) -> Vec<Ipi> {
        core::mem::take(&mut *self.cpus[cpu].pending.lock())
    }
}

impl Mmu for EmulatedMmu {
    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn current_cpu(&self) -> CpuId {
        let cpu = CURRENT_CPU.with(Cell::get);
        assert!(cpu < self.cpus.len(), "current cpu {cpu} does not exist");
        cpu
    }

    fn max_asn(&self) -> u32 {
        self.max_asn
    }

    fn invalidate_page(&self, va: VirtualAddress, asn: u32, global: bool) {
        let cpu = self.cpu();
        let page = va.page_number();
        cpu.counters.single.fetch_add(1, Ordering::Relaxed);
        cpu.tlb
            .lock()
            .retain(|entry| !(entry.page == page && (entry.global || global || entry.asn == asn)));
    }

    fn invalidate_user(&self) {
        let cpu = self.cpu();
        cpu.counters.user.fetch_add(1, Ordering::Relaxed);
        cpu.tlb.lock().retain(|entry| entry.global);
    }

    fn invalidate_all(&self) {
        let cpu = self.cpu();
        cpu.counters.all.fetch_add(1, Ordering::Relaxed);
        cpu.tlb.lock().clear();
    }

    fn sync_icache(&self) {
        self.cpu().counters.icache.fetch_add(1, Ordering::Relaxed);
    }

    fn load_context(&self, level1: PhysicalAddress, asn: u32) {
        let cpu = self.cpu();
        cpu.counters.context_loads.fetch_add(1, Ordering::Relaxed);
        *cpu.context.lock() = Some((level1, asn));
        // Without tags every context switch drops the non-global translations.
        if self.max_asn == 0 {
            cpu.tlb.lock().retain(|entry| entry.global);
        }
    }

    fn send_ipi(&self, cpu: CpuId, ipi: Ipi) {
        self.cpus[cpu].pending.lock().push(ipi);
    }
}
