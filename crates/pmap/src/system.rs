//! The process-wide physical map state and address space lifecycle.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::{sync::Arc, vec::Vec};

use crate::{
    CpuId, CpuMask, DirectMap, FrameAllocator, Ipi, Mmu, PageMetaTable, PhysicalAddress,
    PmapConfig, VirtualAddress,
    asn::{ASN_RESERVED, AsnAllocator},
    pmap::{Level1, Pmap},
    pv::PvPool,
    tlb::TlbBatch,
};

#[cfg(feature = "multiprocessor")]
use crate::tlb::ShootdownQueues;

/// Translated kernel space backed by page tables.
pub(crate) struct KernelRange {
    pub(crate) end: VirtualAddress,
}

/// Totals of the resource stealing slow paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StealStats {
    /// Page table pages obtained by stripping another address space.
    pub table_pages: usize,
    /// Reverse-mapping entries obtained by evicting another address space's mapping.
    pub pv_entries: usize,
    /// Donor candidates visited by every scan so far, successful or not.
    pub candidates_scanned: usize,
}

#[derive(Default)]
pub(crate) struct AtomicStealStats {
    table_pages: AtomicUsize,
    pv_entries: AtomicUsize,
    candidates_scanned: AtomicUsize,
}

/// What a donor scan was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StealKind {
    TablePage,
    PvEntry,
}

/// The physical map of the whole machine.
///
/// Created once by [`Bootstrap::finish`](crate::Bootstrap::finish) and shared by reference
/// afterwards. Lock order, outermost first:
/// 1. the reverse-mapping direction lock (shared for address space to page, exclusive for
///    page to address space)
/// 2. one address space lock
/// 3. one page's reverse-mapping list
///
/// The address space list lock is never held together with an address space lock.
pub struct PmapSystem {
    pub(crate) config: PmapConfig,
    pub(crate) memory: DirectMap,
    pub(crate) mmu: Arc<dyn Mmu>,
    pub(crate) frames: Arc<dyn FrameAllocator>,
    pub(crate) pages: PageMetaTable,
    pub(crate) pv_pool: PvPool,
    pub(crate) pv_direction: spin::RwLock<()>,
    /// Every live address space, least recently activated first.
    pub(crate) pmaps: spin::Mutex<Vec<Arc<Pmap>>>,
    pub(crate) kernel: Arc<Pmap>,
    /// The kernel's level-1 table, shared by every address space without user mappings.
    pub(crate) template: PhysicalAddress,
    pub(crate) asns: AsnAllocator,
    pub(crate) kernel_range: spin::Mutex<KernelRange>,
    #[cfg(feature = "multiprocessor")]
    pub(crate) shootdown: ShootdownQueues,
    next_id: AtomicUsize,
    steal_stats: AtomicStealStats,
}

impl PmapSystem {
    pub(crate) fn new(
        config: PmapConfig,
        memory: DirectMap,
        mmu: Arc<dyn Mmu>,
        frames: Arc<dyn FrameAllocator>,
        pages: PageMetaTable,
        template: PhysicalAddress,
        kernel_end: VirtualAddress,
    ) -> Self {
        let cpu_count = mmu.cpu_count();
        let kernel = Arc::new(Pmap::new(0, true, Level1::SharedTemplate, cpu_count));
        Self {
            pv_pool: PvPool::new(config.pv_entries_per_page, config.pv_pool_max_pages),
            #[cfg(feature = "multiprocessor")]
            shootdown: ShootdownQueues::new(cpu_count, config.shootdown_queue_len),
            asns: AsnAllocator::new(cpu_count, mmu.max_asn()),
            config,
            memory,
            mmu,
            frames,
            pages,
            pv_direction: spin::RwLock::new(()),
            pmaps: spin::Mutex::new(alloc::vec![kernel.clone()]),
            kernel,
            template,
            kernel_range: spin::Mutex::new(KernelRange { end: kernel_end }),
            next_id: AtomicUsize::new(1),
            steal_stats: AtomicStealStats::default(),
        }
    }

    /// The kernel address space.
    pub fn kernel_pmap(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    pub fn config(&self) -> &PmapConfig {
        &self.config
    }

    pub fn memory(&self) -> &DirectMap {
        &self.memory
    }

    pub fn pages(&self) -> &PageMetaTable {
        &self.pages
    }

    /// The kernel's level-1 table.
    pub fn template(&self) -> PhysicalAddress {
        self.template
    }

    /// Snapshot of every live address space, least recently activated first.
    pub fn pmaps(&self) -> Vec<Arc<Pmap>> {
        self.pmaps.lock().clone()
    }

    pub fn steal_stats(&self) -> StealStats {
        let stats = &self.steal_stats;
        StealStats {
            table_pages: stats.table_pages.load(Ordering::Relaxed),
            pv_entries: stats.pv_entries.load(Ordering::Relaxed),
            candidates_scanned: stats.candidates_scanned.load(Ordering::Relaxed),
        }
    }

    /// Records the outcome of one donor scan.
    pub(crate) fn note_steal(&self, kind: StealKind, visited: usize, success: bool) {
        let stats = &self.steal_stats;
        stats
            .candidates_scanned
            .fetch_add(visited, Ordering::Relaxed);
        if success {
            let counter = match kind {
                StealKind::TablePage => &stats.table_pages,
                StealKind::PvEntry => &stats.pv_entries,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        if visited > self.config.donor_scan_warn {
            log::warn!("{kind:?} steal visited {visited} candidates");
        }
    }

    #[inline]
    pub(crate) fn current_cpu(&self) -> CpuId {
        self.mmu.current_cpu()
    }

    /// Starts the TLB work of one operation on the current processor.
    pub(crate) fn tlb(&self) -> TlbBatch<'_> {
        #[cfg(feature = "multiprocessor")]
        {
            TlbBatch::new(&*self.mmu, &self.asns, &self.shootdown)
        }
        #[cfg(not(feature = "multiprocessor"))]
        {
            TlbBatch::new(&*self.mmu, &self.asns)
        }
    }

    /// Physical address of the level-1 table an address space walks.
    pub(crate) fn level1_address(&self, level1: Level1) -> PhysicalAddress {
        match level1 {
            Level1::SharedTemplate => self.template,
            Level1::Private(level1) => level1,
        }
    }

    /// Creates an empty user address space.
    ///
    /// The new address space borrows the kernel template until its first mapping.
    pub fn create(&self) -> Arc<Pmap> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pmap = Arc::new(Pmap::new(
            id,
            false,
            Level1::SharedTemplate,
            self.mmu.cpu_count(),
        ));
        self.pmaps.lock().push(pmap.clone());
        log::debug!("pmap {id} created");
        pmap
    }

    /// Adds a reference to an address space.
    pub fn reference(&self, pmap: &Arc<Pmap>) {
        pmap.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reference to an address space, destroying it with the last one.
    ///
    /// # Panics
    /// Panics if the last reference goes while mappings remain or the address space is
    /// still active, or if the kernel address space is destroyed.
    pub fn destroy(&self, pmap: &Arc<Pmap>) {
        let previous = pmap.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "pmap {} over-released", pmap.id());
        if previous > 1 {
            return;
        }
        assert!(!pmap.is_kernel(), "destroying the kernel pmap");

        let cpu = self.current_cpu();
        {
            let mut inner = pmap.inner.lock(cpu);
            assert_eq!(
                inner.stats.resident,
                0,
                "pmap {} destroyed with valid mappings",
                pmap.id()
            );
            assert!(
                pmap.active.load().is_empty(),
                "pmap {} destroyed while active",
                pmap.id()
            );
            // A level-1 table whose release was deferred by a remote activation.
            if let Level1::Private(_) = inner.level1 {
                self.destroy_level1(pmap, &mut inner, cpu);
            }
        }

        self.pmaps.lock().retain(|other| !Arc::ptr_eq(other, pmap));
        log::debug!("pmap {} destroyed", pmap.id());
    }

    /// Makes `pmap` the address space of `cpu`, which must be the current processor.
    ///
    /// Callable from the context switch path: it never blocks on anything but spin locks.
    pub fn activate(&self, pmap: &Arc<Pmap>, cpu: CpuId) {
        debug_assert_eq!(cpu, self.current_cpu());

        {
            let mut pmaps = self.pmaps.lock();
            if let Some(position) = pmaps.iter().position(|other| Arc::ptr_eq(other, pmap)) {
                let pmap = pmaps.remove(position);
                pmaps.push(pmap);
            }
        }

        let inner = pmap.inner.lock(cpu);
        pmap.active.insert(cpu);
        let asn = self.asns.assign(&*self.mmu, pmap, inner.level1, cpu);
        if self.asns.max_asn() > 0 && matches!(inner.level1, Level1::Private(_)) {
            assert_ne!(
                asn,
                ASN_RESERVED,
                "pmap {} has a private level-1 table but the reserved ASN",
                pmap.id()
            );
        }
        self.mmu.load_context(self.level1_address(inner.level1), asn);
        log::trace!("cpu {cpu}: activated pmap {} with ASN {asn}", pmap.id());
    }

    /// Marks `pmap` as no longer running on `cpu`, the current processor.
    ///
    /// A processor that leaves a private level-1 table switches to the kernel template, so
    /// the table can be freed without being walked afterwards. This also releases a
    /// level-1 table whose release was deferred.
    pub fn deactivate(&self, pmap: &Arc<Pmap>, cpu: CpuId) {
        debug_assert_eq!(cpu, self.current_cpu());

        let mut inner = pmap.inner.lock(cpu);
        pmap.active.remove(cpu);
        if let Level1::Private(level1) = inner.level1 {
            self.mmu.load_context(self.template, ASN_RESERVED);
            if self.pages.refcount(level1) == 0 && pmap.active.load().is_empty() {
                self.destroy_level1(pmap, &mut inner, cpu);
            }
        }
    }

    /// Performs the instruction stream synchronization `pmap` owes `cpu`, if any.
    ///
    /// Called on the way back out to user mode.
    pub fn sync_icache_on_return(&self, pmap: &Pmap, cpu: CpuId) {
        if pmap.needs_isync.remove(cpu) {
            self.mmu.sync_icache();
        }
    }

    /// Synchronizes the instruction stream of every processor after a kernel text change.
    pub(crate) fn sync_icache_kernel(&self) {
        self.mmu.sync_icache();
        #[cfg(feature = "multiprocessor")]
        {
            let others = CpuMask::first(self.mmu.cpu_count()).without(self.current_cpu());
            for cpu in others.iter() {
                self.mmu.send_ipi(cpu, Ipi::InstructionSync);
            }
        }
    }

    /// Flags every processor to synchronize the instruction stream before returning to
    /// user mode in `pmap`.
    pub(crate) fn sync_icache_user(&self, pmap: &Pmap) {
        pmap.needs_isync
            .store(CpuMask::first(self.mmu.cpu_count()));
    }

    /// Drains the shootdown queue of the current processor.
    #[cfg(feature = "multiprocessor")]
    pub fn process_shootdown(&self) {
        self.shootdown
            .process(&*self.mmu, &self.asns, self.template);
    }

    /// Entry point for inter-processor interrupts sent by this layer.
    ///
    /// Must not be called while the current processor holds an address space lock.
    pub fn handle_ipi(&self, ipi: Ipi) {
        match ipi {
            #[cfg(feature = "multiprocessor")]
            Ipi::Shootdown => self.process_shootdown(),
            #[cfg(not(feature = "multiprocessor"))]
            Ipi::Shootdown => {}
            Ipi::InstructionSync => self.mmu.sync_icache(),
        }
    }

    /// Shootdown queue of `cpu`, for inspection.
    #[cfg(feature = "multiprocessor")]
    pub fn shootdown_queues(&self) -> &ShootdownQueues {
        &self.shootdown
    }

    /// Checks that no two address spaces with private tables hold the same ASN in the
    /// current generation of any processor.
    ///
    /// # Panics
    /// Panics on a duplicate.
    #[cfg(any(test, feature = "debug-checks"))]
    pub fn check_asn_exclusive(&self) {
        let cpu = self.current_cpu();
        let pmaps = self.pmaps();
        for target in 0..self.mmu.cpu_count() {
            let generation = self.asns.generation(target);
            let mut seen: Vec<(u32, usize)> = Vec::new();
            for pmap in &pmaps {
                if !matches!(pmap.level1(cpu), Level1::Private(_)) {
                    continue;
                }
                let (asn, asn_generation) = pmap.asn(target);
                if asn == ASN_RESERVED || asn_generation != generation {
                    continue;
                }
                if let Some((_, owner)) = seen.iter().find(|(other, _)| *other == asn) {
                    panic!(
                        "cpu {target}: ASN {asn} held by pmaps {owner} and {}",
                        pmap.id()
                    );
                }
                seen.push((asn, pmap.id()));
            }
        }
    }
}
