//! Address space objects.
//!
//! A [`Pmap`] is the physical map of one virtual address space. It belongs to the kernel
//! or to a user process and is shared between its users through an `Arc`; the operations
//! on it live on [`PmapSystem`](crate::PmapSystem).

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;

use crate::{
    AtomicCpuMask, CpuId, PhysicalAddress,
    asn::{ASN_RESERVED, GENERATION_INVALID},
    lock::PmapLock,
};

/// Where the level-1 table of an address space comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level1 {
    /// Borrowing the kernel template. No user mappings can exist.
    SharedTemplate,
    /// A private level-1 table that holds user mappings.
    Private(PhysicalAddress),
}

/// Counters kept for each address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmapStats {
    /// Valid leaf mappings.
    pub resident: usize,
    /// Wired leaf mappings.
    pub wired: usize,
    /// Private level-2 tables.
    pub level2_tables: usize,
    /// Private level-3 tables.
    pub level3_tables: usize,
}

/// State protected by the address space lock.
pub(crate) struct PmapInner {
    pub(crate) level1: Level1,
    pub(crate) stats: PmapStats,
}

/// ASN of an address space on one processor.
pub(crate) struct AsnSlot {
    pub(crate) asn: AtomicU32,
    pub(crate) generation: AtomicU64,
}

impl AsnSlot {
    fn new() -> Self {
        Self {
            asn: AtomicU32::new(ASN_RESERVED),
            generation: AtomicU64::new(GENERATION_INVALID),
        }
    }
}

/// The physical map of one address space.
pub struct Pmap {
    id: usize,
    kernel: bool,
    /// Explicit references held by the VM system. The `Arc` count is separate and also
    /// covers internal references such as reverse-mapping entries.
    pub(crate) refcount: AtomicUsize,
    /// Processors on which this address space is active.
    pub(crate) active: AtomicCpuMask,
    /// Processors that must synchronize the instruction stream before returning to user
    /// mode in this address space.
    pub(crate) needs_isync: AtomicCpuMask,
    pub(crate) asn: Box<[AsnSlot]>,
    pub(crate) inner: PmapLock<PmapInner>,
}

impl Pmap {
    pub(crate) fn new(id: usize, kernel: bool, level1: Level1, cpu_count: usize) -> Self {
        Self {
            id,
            kernel,
            refcount: AtomicUsize::new(1),
            active: AtomicCpuMask::default(),
            needs_isync: AtomicCpuMask::default(),
            asn: (0..cpu_count).map(|_| AsnSlot::new()).collect(),
            inner: PmapLock::new(PmapInner {
                level1,
                stats: PmapStats::default(),
            }),
        }
    }

    /// Identifier unique among live address spaces. The kernel is 0.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Snapshot of the counters, taken under the address space lock.
    pub fn stats(&self, cpu: CpuId) -> PmapStats {
        self.inner.lock(cpu).stats
    }

    /// Current level-1 state, taken under the address space lock.
    pub fn level1(&self, cpu: CpuId) -> Level1 {
        self.inner.lock(cpu).level1
    }

    pub fn resident_count(&self, cpu: CpuId) -> usize {
        self.stats(cpu).resident
    }

    pub fn wired_count(&self, cpu: CpuId) -> usize {
        self.stats(cpu).wired
    }

    pub fn is_active_on(&self, cpu: CpuId) -> bool {
        self.active.contains(cpu)
    }

    /// The ASN and generation this address space holds on `cpu`.
    pub fn asn(&self, cpu: CpuId) -> (u32, u64) {
        let slot = &self.asn[cpu];
        (
            slot.asn.load(Ordering::Acquire),
            slot.generation.load(Ordering::Acquire),
        )
    }

    pub(crate) fn set_asn(&self, cpu: CpuId, asn: u32, generation: u64) {
        let slot = &self.asn[cpu];
        slot.asn.store(asn, Ordering::Release);
        slot.generation.store(generation, Ordering::Release);
    }

    /// Forgets the ASN on `cpu` so the next activation there draws a fresh one.
    pub(crate) fn invalidate_asn(&self, cpu: CpuId) {
        self.asn[cpu]
            .generation
            .store(GENERATION_INVALID, Ordering::Release);
    }

    /// Resets every processor to the reserved ASN.
    pub(crate) fn reset_asns(&self) {
        for cpu in 0..self.asn.len() {
            self.set_asn(cpu, ASN_RESERVED, GENERATION_INVALID);
        }
    }
}

impl core::fmt::Debug for Pmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("kernel", &self.kernel)
            .field("active", &self.active.load())
            .finish_non_exhaustive()
    }
}
