//! Mapping operations.

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;

use crate::{
    PhysicalAddress, PmapError, PmapSystem, VirtualAddress,
    arch::{
        L1_SEGMENT_SIZE, L2_SEGMENT_SIZE, PAGE_SIZE, PageEntry, PageFlags, VM_MAX_KERNEL_ADDRESS,
        VM_MAX_USER_ADDRESS,
    },
    page_meta::PageAttributes,
    page_table::LeafSlot,
    pmap::{Level1, Pmap, PmapInner},
    protection::{VmProt, protection_bits},
    pv::PvLock,
    tlb::TlbBatch,
};

bitflags! {
    /// Options of [`PmapSystem::enter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnterFlags: u8 {
        /// Pin the mapping against removal by stealing and `collect`.
        const WIRED = 1 << 0;
        /// Return allocation failure instead of panicking.
        const MAY_FAIL = 1 << 1;
    }
}

/// End of the segment of `size` bytes containing `va`, clamped to `limit`.
fn segment_end(va: VirtualAddress, size: usize, limit: VirtualAddress) -> VirtualAddress {
    let next = va.align_down(size).as_usize() + size;
    if next >= limit.as_usize() {
        limit
    } else {
        VirtualAddress::new(next)
    }
}

impl PmapSystem {
    fn check_range(pmap: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        assert!(start <= end, "inverted range {start}..{end}");
        if pmap.is_kernel() {
            assert!(
                start.is_kernel() && end.as_usize() <= VM_MAX_KERNEL_ADDRESS,
                "kernel range {start}..{end} outside kernel space"
            );
        } else {
            assert!(
                end.as_usize() <= VM_MAX_USER_ADDRESS,
                "user range {start}..{end} crosses into kernel space"
            );
        }
    }

    /// Maps `pa` at `va` in `pmap` with protection `prot`.
    ///
    /// Replaces whatever `va` mapped before. The mapping is visible to every processor when
    /// this returns.
    ///
    /// # Panics
    /// Panics if `va` lies outside the address space of `pmap`, or if memory runs out and
    /// [`EnterFlags::MAY_FAIL`] is not set.
    pub fn enter(
        &self,
        pmap: &Arc<Pmap>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        flags: EnterFlags,
    ) -> Result<(), PmapError> {
        let va = va.align_down(PAGE_SIZE);
        let pa = pa.align_down(PAGE_SIZE);
        if pmap.is_kernel() {
            assert!(va.is_kernel(), "kernel mapping at non-kernel address {va}");
        } else {
            assert!(va.is_user(), "user mapping at non-user address {va}");
        }

        let result = {
            let _direction = self.pv_direction.read();
            let mut tlb = self.tlb();
            let mut inner = pmap.inner.lock(tlb.cpu());
            self.enter_locked(pmap, &mut inner, va, pa, prot, flags, &mut tlb)
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) if flags.contains(EnterFlags::MAY_FAIL) => Err(error),
            Err(error) => {
                log::error!("enter {va} -> {pa} in pmap {}: {error}", pmap.id());
                panic!("pmap enter failed: {error}");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_locked(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        flags: EnterFlags,
        tlb: &mut TlbBatch<'_>,
    ) -> Result<(), PmapError> {
        let kernel = pmap.is_kernel();
        let wired = flags.contains(EnterFlags::WIRED);
        let slot = if kernel {
            self.kernel_leaf(va)
        } else {
            self.walk_or_create(pmap, inner, va, tlb)?
        };
        let old = self.read_leaf(slot);

        if old.is_valid() && old.address() == pa {
            // Same page: only wiring and protection can change.
            let mut new_flags = old
                .flags()
                .difference(PageFlags::PROTECTION)
                .union(protection_bits(kernel, prot));
            new_flags.set(PageFlags::WIRED, wired);
            if wired != old.is_wired() {
                if wired {
                    inner.stats.wired += 1;
                } else {
                    inner.stats.wired -= 1;
                }
            }
            let new = old.with_flags(new_flags);
            if new != old {
                self.write_leaf(slot, new);
                let changed = new_flags.symmetric_difference(old.flags());
                if !changed.difference(PageFlags::SOFTWARE).is_empty() {
                    tlb.invalidate(pmap, va, old);
                }
            }
            self.sync_after_enter(pmap, prot);
            log::trace!("pmap {}: updated {va} -> {pa} {new_flags:?}", pmap.id());
            return Ok(());
        }

        // Hold the leaf table for the new mapping before the old one goes, so replacing
        // the only mapping in it does not free it.
        if !kernel {
            self.pages.add_ref(slot.table);
        }
        if old.is_valid() {
            self.remove_mapping(pmap, inner, va, slot, old, PvLock::Acquire, tlb);
        }

        let mut new_flags = PageFlags::VALID | protection_bits(kernel, prot);
        if let Some(meta) = self.pages.get(pa) {
            if let Err(error) = self.pv_enter(pmap, pa, va, slot, tlb) {
                if !kernel {
                    self.delref_level3(pmap, inner, va, tlb);
                }
                return Err(error);
            }
            new_flags |= PageFlags::PV_LIST;
            let attributes = meta.attributes();
            if !attributes.contains(PageAttributes::REFERENCED) {
                new_flags |= PageFlags::FAULT_BITS;
            } else if !attributes.contains(PageAttributes::MODIFIED) {
                new_flags |= PageFlags::FAULT_ON_WRITE;
            }
        }
        if wired {
            new_flags |= PageFlags::WIRED;
            inner.stats.wired += 1;
        }
        inner.stats.resident += 1;

        let new = PageEntry::new(pa, new_flags);
        self.write_leaf(slot, new);
        tlb.invalidate(pmap, va, new);
        self.sync_after_enter(pmap, prot);
        log::trace!("pmap {}: entered {va} -> {pa} {new_flags:?}", pmap.id());
        Ok(())
    }

    fn sync_after_enter(&self, pmap: &Pmap, prot: VmProt) {
        if !prot.contains(VmProt::EXECUTE) {
            return;
        }
        if pmap.is_kernel() {
            self.sync_icache_kernel();
        } else {
            self.sync_icache_user(pmap);
        }
    }

    /// Removes one valid leaf mapping and releases what it held.
    ///
    /// The caller holds the lock of `pmap` and, unless `pv` says otherwise, none of the
    /// list locks.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn remove_mapping(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        va: VirtualAddress,
        slot: LeafSlot,
        pte: PageEntry,
        pv: PvLock<'_>,
        tlb: &mut TlbBatch<'_>,
    ) {
        debug_assert!(pte.is_valid(), "removing an invalid mapping at {va}");
        self.memory.table(slot.table).clear_entry(slot.index);
        inner.stats.resident -= 1;
        if pte.is_wired() {
            inner.stats.wired -= 1;
        }

        if pte.flags().contains(PageFlags::PV_LIST) {
            match pv {
                PvLock::Acquire => {
                    self.pages.page(pte.address()).pv.lock().take(pmap, va);
                }
                PvLock::Held(list) => {
                    list.take(pmap, va);
                }
            }
            self.pv_pool.release();
        }

        tlb.invalidate(pmap, va, pte);
        log::trace!("pmap {}: removed {va} -> {}", pmap.id(), pte.address());

        if !pmap.is_kernel() {
            self.delref_level3(pmap, inner, va, tlb);
        }
    }

    /// Removes the mappings of `start..end` in `pmap`. Wired mappings are only removed
    /// with `remove_wired`.
    pub fn remove_range(
        &self,
        pmap: &Arc<Pmap>,
        start: VirtualAddress,
        end: VirtualAddress,
        remove_wired: bool,
    ) {
        let start = start.align_down(PAGE_SIZE);
        let end = end.align_up(PAGE_SIZE);
        Self::check_range(pmap, start, end);

        let _direction = self.pv_direction.read();
        let mut tlb = self.tlb();
        let mut inner = pmap.inner.lock(tlb.cpu());

        if pmap.is_kernel() {
            let leaves = self.valid_leaves(self.template, start, end);
            for (va, slot, pte) in leaves {
                if remove_wired || !pte.is_wired() {
                    self.remove_mapping(pmap, &mut inner, va, slot, pte, PvLock::Acquire, &mut tlb);
                }
            }
            return;
        }

        let mut va = start;
        while va < end {
            let Level1::Private(level1) = inner.level1 else {
                break;
            };
            let l1_end = segment_end(va, L1_SEGMENT_SIZE, end);
            let l1_entry = self.memory.table(level1).entry(va.page_index(1));
            if l1_entry.is_valid() {
                self.remove_level2_range(
                    pmap,
                    &mut inner,
                    l1_entry.address(),
                    va,
                    l1_end,
                    remove_wired,
                    &mut tlb,
                );
            }
            va = l1_end;
        }
    }

    /// Removes the mappings of `start..end`, which lie under one level-2 table.
    ///
    /// Each table is held by an extra reference while its entries are removed, so it is
    /// only freed once the walk is done with it.
    #[allow(clippy::too_many_arguments)]
    fn remove_level2_range(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        level2: PhysicalAddress,
        start: VirtualAddress,
        end: VirtualAddress,
        remove_wired: bool,
        tlb: &mut TlbBatch<'_>,
    ) {
        self.pages.add_ref(level2);

        let mut va = start;
        while va < end {
            let l2_end = segment_end(va, L2_SEGMENT_SIZE, end);
            let l2_entry = self.memory.table(level2).entry(va.page_index(2));
            if l2_entry.is_valid() {
                let level3 = l2_entry.address();
                self.pages.add_ref(level3);

                let first = va.page_index(3);
                let count = (l2_end - va) / PAGE_SIZE;
                let leaves: Vec<_> = self
                    .memory
                    .table(level3)
                    .valid_entries(first..first + count)
                    .collect();
                let base = va.align_down(L2_SEGMENT_SIZE);
                for (index, pte) in leaves {
                    if remove_wired || !pte.is_wired() {
                        let slot = LeafSlot {
                            table: level3,
                            index,
                        };
                        let leaf_va = base + index * PAGE_SIZE;
                        self.remove_mapping(pmap, inner, leaf_va, slot, pte, PvLock::Acquire, tlb);
                    }
                }

                self.delref_level3(pmap, inner, va, tlb);
            }
            va = l2_end;
        }

        self.delref_level2(pmap, inner, start, tlb);
    }

    /// Valid leaves of `start..end` in the tree rooted at `level1`.
    pub(crate) fn valid_leaves(
        &self,
        level1: PhysicalAddress,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Vec<(VirtualAddress, LeafSlot, PageEntry)> {
        let mut leaves = Vec::new();
        let mut va = start;
        while va < end {
            let l1_end = segment_end(va, L1_SEGMENT_SIZE, end);
            let l1_entry = self.memory.table(level1).entry(va.page_index(1));
            if !l1_entry.is_valid() {
                va = l1_end;
                continue;
            }
            while va < l1_end {
                let l2_end = segment_end(va, L2_SEGMENT_SIZE, l1_end);
                let l2_entry = self.memory.table(l1_entry.address()).entry(va.page_index(2));
                if l2_entry.is_valid() {
                    let level3 = l2_entry.address();
                    let first = va.page_index(3);
                    let count = (l2_end - va) / PAGE_SIZE;
                    let base = va.align_down(L2_SEGMENT_SIZE);
                    leaves.extend(
                        self.memory
                            .table(level3)
                            .valid_entries(first..first + count)
                            .map(|(index, pte)| {
                                (
                                    base + index * PAGE_SIZE,
                                    LeafSlot {
                                        table: level3,
                                        index,
                                    },
                                    pte,
                                )
                            }),
                    );
                }
                va = l2_end;
            }
        }
        leaves
    }

    /// Changes the protection of the existing mappings of `start..end`.
    ///
    /// A protection without read removes the mappings instead.
    pub fn change_protection(
        &self,
        pmap: &Arc<Pmap>,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: VmProt,
    ) {
        if !prot.contains(VmProt::READ) {
            self.remove_range(pmap, start, end, true);
            return;
        }
        let start = start.align_down(PAGE_SIZE);
        let end = end.align_up(PAGE_SIZE);
        Self::check_range(pmap, start, end);

        let bits = protection_bits(pmap.is_kernel(), prot);
        let mut changed = false;
        {
            let _direction = self.pv_direction.read();
            let mut tlb = self.tlb();
            let inner = pmap.inner.lock(tlb.cpu());
            if !pmap.is_kernel() && inner.level1 == Level1::SharedTemplate {
                return;
            }

            let level1 = self.level1_address(inner.level1);
            for (va, slot, old) in self.valid_leaves(level1, start, end) {
                let flags = old.flags().difference(PageFlags::PROTECTION).union(bits);
                if flags == old.flags() {
                    continue;
                }
                self.write_leaf(slot, old.with_flags(flags));
                tlb.invalidate(pmap, va, old);
                changed = true;
            }
        }
        if changed {
            self.sync_after_enter(pmap, prot);
        }
    }

    /// Sets or clears the wired bit of the mapping at `va`.
    ///
    /// # Panics
    /// Panics if `va` is not mapped.
    pub fn change_wiring(&self, pmap: &Pmap, va: VirtualAddress, wired: bool) {
        let mut inner = pmap.inner.lock(self.current_cpu());
        let Some((slot, pte)) = self
            .lookup_leaf(inner.level1, va)
            .map(|slot| (slot, self.read_leaf(slot)))
            .filter(|(_, pte)| pte.is_valid())
        else {
            panic!("change_wiring: {va} not mapped in pmap {}", pmap.id());
        };

        if pte.is_wired() == wired {
            return;
        }
        let mut flags = pte.flags();
        flags.set(PageFlags::WIRED, wired);
        self.write_leaf(slot, pte.with_flags(flags));
        if wired {
            inner.stats.wired += 1;
        } else {
            inner.stats.wired -= 1;
        }
    }

    /// Clears the wired bit of the mapping at `va`.
    pub fn unwire(&self, pmap: &Pmap, va: VirtualAddress) {
        self.change_wiring(pmap, va, false);
    }

    /// Returns the physical address `va` translates to in `pmap`.
    ///
    /// Direct-mapped addresses translate without tables.
    pub fn extract(&self, pmap: &Pmap, va: VirtualAddress) -> Option<PhysicalAddress> {
        if va.is_k0seg() {
            return Some(va.k0seg_to_physical());
        }
        let inner = pmap.inner.lock(self.current_cpu());
        let slot = self.lookup_leaf(inner.level1, va)?;
        let pte = self.read_leaf(slot);
        pte.is_valid().then(|| pte.address() + va.page_offset())
    }

    /// Removes every unwired mapping of an address space that is not running anywhere,
    /// so its table pages return to the frame allocator.
    ///
    /// Returns false if the address space was skipped.
    pub fn collect(&self, pmap: &Arc<Pmap>) -> bool {
        if pmap.is_kernel() || !pmap.active.load().is_empty() {
            return false;
        }
        self.remove_range(
            pmap,
            VirtualAddress::new(0),
            VirtualAddress::new(VM_MAX_USER_ADDRESS),
            false,
        );
        log::debug!("pmap {}: collected", pmap.id());
        true
    }

    /// Maps the physical range `start..end` wired into kernel space from `va`, returning
    /// the address after the last page.
    ///
    /// # Panics
    /// Panics if a page cannot be mapped for lack of memory.
    pub fn map_range(
        &self,
        va: VirtualAddress,
        start: PhysicalAddress,
        end: PhysicalAddress,
        prot: VmProt,
    ) -> VirtualAddress {
        let mut va = va.align_down(PAGE_SIZE);
        let mut pa = start.align_down(PAGE_SIZE);
        while pa < end {
            let flags = EnterFlags::WIRED | EnterFlags::MAY_FAIL;
            if let Err(error) = self.enter(&self.kernel, va, pa, prot, flags) {
                log::error!("map_range: cannot map {va} -> {pa}");
                panic!("map_range: {error}");
            }
            va = va + PAGE_SIZE;
            pa = pa + PAGE_SIZE;
        }
        va
    }

    pub fn zero_page(&self, pa: PhysicalAddress) {
        self.memory.zero_page(pa.align_down(PAGE_SIZE));
    }

    pub fn copy_page(&self, source: PhysicalAddress, destination: PhysicalAddress) {
        self.memory
            .copy_page(source.align_down(PAGE_SIZE), destination.align_down(PAGE_SIZE));
    }
}
