//! Collaborators the physical map calls out to.
//!
//! The layer never touches privileged hardware state directly. Everything processor
//! specific goes through [`Mmu`], and page frames come from a [`FrameAllocator`].

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{PageUsage, PhysicalAddress, VirtualAddress};

/// Index of a processor.
pub type CpuId = usize;

/// Maximum number of processors the layer tracks.
pub const MAX_CPUS: usize = 64;

/// Inter-processor interrupts sent by the physical map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipi {
    /// Drain the TLB shootdown queue.
    Shootdown,
    /// Synchronize the instruction stream.
    InstructionSync,
}

/// Privileged processor operations.
///
/// Every operation except [`Mmu::send_ipi`] acts on the processor executing it.
pub trait Mmu: Send + Sync {
    /// Number of processors in the system.
    fn cpu_count(&self) -> usize;

    /// The processor executing the caller.
    fn current_cpu(&self) -> CpuId;

    /// Largest ASN the hardware supports. Zero means the TLB is not tagged.
    fn max_asn(&self) -> u32;

    /// Invalidates the translation of one page. `global` entries are matched regardless
    /// of their ASN; others only under `asn`.
    fn invalidate_page(&self, va: VirtualAddress, asn: u32, global: bool);

    /// Invalidates every translation not marked address-space-match.
    fn invalidate_user(&self);

    /// Invalidates every translation.
    fn invalidate_all(&self);

    /// Instruction memory barrier.
    fn sync_icache(&self);

    /// Switches the processor to a level-1 table and ASN.
    fn load_context(&self, level1: PhysicalAddress, asn: u32);

    /// Signals another processor.
    fn send_ipi(&self, cpu: CpuId, ipi: Ipi);
}

/// The physical frame allocator.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one page. The contents are unspecified.
    fn alloc_page(&self, usage: PageUsage) -> Option<PhysicalAddress>;

    /// Returns a page to the allocator.
    fn free_page(&self, page: PhysicalAddress);
}

/// A set of processors.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const EMPTY: Self = Self(0);

    /// Every processor below `count`.
    pub const fn first(count: usize) -> Self {
        assert!(count <= MAX_CPUS, "too many processors");
        if count == MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu)
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu) != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | (1 << cpu))
    }

    #[inline]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu))
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterates over the processors in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as CpuId;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A [`CpuMask`] that can be updated without a lock.
#[derive(Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new(mask: CpuMask) -> Self {
        Self(AtomicU64::new(mask.0))
    }

    pub fn load(&self) -> CpuMask {
        CpuMask(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, mask: CpuMask) {
        self.0.store(mask.0, Ordering::Release);
    }

    pub fn insert(&self, cpu: CpuId) {
        self.0.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    /// Removes `cpu`, returning whether it was present.
    pub fn remove(&self, cpu: CpuId) -> bool {
        self.0.fetch_and(!(1 << cpu), Ordering::AcqRel) & (1 << cpu) != 0
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.load().contains(cpu)
    }
}
