//! The three-level page table tree.
//!
//! User address spaces grow their tree lazily. Level-2 and level-3 tables count the valid
//! entries below them in the metadata of their own page, and free themselves when that
//! count drops to zero. The level-1 table counts its user slots the same way; at zero the
//! address space goes back to borrowing the kernel template.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    CpuId, PageUsage, PhysicalAddress, PmapError, PmapSystem, VirtualAddress,
    arch::{
        self, ENTRIES_PER_TABLE, KERNEL_L1_FIRST, L1_SEGMENT_SIZE, L2_SEGMENT_SIZE, PAGE_SIZE,
        PAGE_TABLE_LEVELS, PageEntry, PageFlags, USER_L1_SLOTS, VPT_INDEX,
    },
    asn::ASN_RESERVED,
    pmap::{Level1, Pmap, PmapInner},
    pv::PvLock,
    system::StealKind,
    tlb::TlbBatch,
};

/// The location of one leaf entry: a level-3 table and an index into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LeafSlot {
    pub(crate) table: PhysicalAddress,
    pub(crate) index: usize,
}

impl LeafSlot {
    /// Physical address of the entry itself.
    pub(crate) fn address(self) -> PhysicalAddress {
        self.table + self.index * core::mem::size_of::<u64>()
    }
}

/// Composes a user address from its three table indices.
fn user_address(l1: usize, l2: usize, l3: usize) -> VirtualAddress {
    VirtualAddress::new(l1 * L1_SEGMENT_SIZE + l2 * L2_SEGMENT_SIZE + l3 * PAGE_SIZE)
}

impl PmapSystem {
    pub(crate) fn read_leaf(&self, slot: LeafSlot) -> PageEntry {
        self.memory.table(slot.table).entry(slot.index)
    }

    pub(crate) fn write_leaf(&self, slot: LeafSlot, entry: PageEntry) {
        self.memory.table(slot.table).set_entry(slot.index, entry);
    }

    /// Walks to the leaf slot of `va` without creating anything.
    pub(crate) fn lookup_leaf(&self, level1: Level1, va: VirtualAddress) -> Option<LeafSlot> {
        let mut table = self.level1_address(level1);
        for level in 1..PAGE_TABLE_LEVELS {
            let entry = self.memory.table(table).entry(va.page_index(level));
            if !entry.is_valid() {
                return None;
            }
            table = entry.address();
        }
        Some(LeafSlot {
            table,
            index: va.page_index(PAGE_TABLE_LEVELS),
        })
    }

    /// Leaf slot of a kernel address. Kernel tables are never freed.
    ///
    /// # Panics
    /// Panics if `va` is beyond the grown kernel range.
    pub(crate) fn kernel_leaf(&self, va: VirtualAddress) -> LeafSlot {
        match self.lookup_leaf(Level1::SharedTemplate, va) {
            Some(slot) => slot,
            None => panic!("kernel address {va} beyond the grown kernel range"),
        }
    }

    /// Gives `pmap` its own level-1 table if it is still on the kernel template.
    ///
    /// The kernel slots are copied from the template under the address space lock, which
    /// is also how kernel growth reaches private tables, so no growth can be missed.
    pub(crate) fn ensure_level1_private(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        tlb: &mut TlbBatch<'_>,
    ) -> Result<PhysicalAddress, PmapError> {
        if let Level1::Private(level1) = inner.level1 {
            return Ok(level1);
        }
        assert!(!pmap.is_kernel(), "kernel pmap cannot leave the template");

        let level1 = self.alloc_table_page(pmap, PageUsage::Level1, tlb)?;
        let table = self.memory.table(level1);
        table.copy_from(
            self.memory.table(self.template),
            KERNEL_L1_FIRST..ENTRIES_PER_TABLE,
        );
        table.set_entry(VPT_INDEX, PageEntry::new(level1, PageFlags::USER_TABLE));
        inner.level1 = Level1::Private(level1);
        log::debug!("pmap {}: private level-1 table at {level1}", pmap.id());

        let cpu = tlb.cpu();
        if pmap.is_active_on(cpu) {
            let asn = self.asns.assign(&*self.mmu, pmap, inner.level1, cpu);
            self.mmu.load_context(level1, asn);
        }
        tlb.reload(pmap);
        Ok(level1)
    }

    /// Walks to the leaf slot of a user address, creating missing tables.
    ///
    /// Each parent is referenced before its child is allocated, so a failed allocation
    /// unwinds through the normal release path.
    pub(crate) fn walk_or_create(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        va: VirtualAddress,
        tlb: &mut TlbBatch<'_>,
    ) -> Result<LeafSlot, PmapError> {
        let level1 = self.ensure_level1_private(pmap, inner, tlb)?;

        let l1_index = va.page_index(1);
        let l1_entry = self.memory.table(level1).entry(l1_index);
        let level2 = if l1_entry.is_valid() {
            l1_entry.address()
        } else {
            self.pages.add_ref(level1);
            match self.alloc_table_page(pmap, PageUsage::Level2, tlb) {
                Ok(level2) => {
                    self.memory
                        .table(level1)
                        .set_entry(l1_index, PageEntry::new(level2, PageFlags::USER_TABLE));
                    inner.stats.level2_tables += 1;
                    level2
                }
                Err(error) => {
                    self.delref_level1(pmap, inner, tlb);
                    return Err(error);
                }
            }
        };

        let l2_index = va.page_index(2);
        let l2_entry = self.memory.table(level2).entry(l2_index);
        let level3 = if l2_entry.is_valid() {
            l2_entry.address()
        } else {
            self.pages.add_ref(level2);
            match self.alloc_table_page(pmap, PageUsage::Level3, tlb) {
                Ok(level3) => {
                    self.memory
                        .table(level2)
                        .set_entry(l2_index, PageEntry::new(level3, PageFlags::USER_TABLE));
                    inner.stats.level3_tables += 1;
                    level3
                }
                Err(error) => {
                    self.delref_level2(pmap, inner, va, tlb);
                    return Err(error);
                }
            }
        };

        Ok(LeafSlot {
            table: level3,
            index: va.page_index(3),
        })
    }

    /// Allocates and zeroes a page table page, stealing one if the allocator is dry.
    pub(crate) fn alloc_table_page(
        &self,
        requester: &Pmap,
        usage: PageUsage,
        tlb: &mut TlbBatch<'_>,
    ) -> Result<PhysicalAddress, PmapError> {
        let page = match self.frames.alloc_page(usage) {
            Some(page) => page,
            None => self
                .steal_table_page(requester, usage, tlb)
                .ok_or(PmapError::OutOfMemory)?,
        };
        self.pages.set_usage(page, usage);
        self.memory.zero_page(page);
        log::debug!("allocated {usage:?} table at {page}");
        Ok(page)
    }

    pub(crate) fn free_table_page(&self, page: PhysicalAddress) {
        log::debug!("freeing {:?} table at {page}", self.pages.classify(page));
        self.pages.set_usage(page, PageUsage::Unused);
        self.frames.free_page(page);
    }

    /// Drops one reference to the level-3 table mapping `va`, freeing it at zero.
    pub(crate) fn delref_level3(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        va: VirtualAddress,
        tlb: &mut TlbBatch<'_>,
    ) {
        let level1 = self.private_level1(pmap, inner);
        let level2 = self.memory.table(level1).entry(va.page_index(1)).address();
        let l2_index = va.page_index(2);
        let level3 = self.memory.table(level2).entry(l2_index).address();

        if self.pages.del_ref(level3) > 0 {
            return;
        }

        let link = self.memory.table(level2).clear_entry(l2_index);
        // The table was reachable as a page of the virtual page table.
        let vpt_page = VirtualAddress::new(arch::vpt_entry_address(va.as_usize()))
            .align_down(PAGE_SIZE);
        tlb.invalidate(pmap, vpt_page, link);

        inner.stats.level3_tables -= 1;
        self.free_table_page(level3);
        self.delref_level2(pmap, inner, va, tlb);
    }

    /// Drops one reference to the level-2 table mapping `va`, freeing it at zero.
    pub(crate) fn delref_level2(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        va: VirtualAddress,
        tlb: &mut TlbBatch<'_>,
    ) {
        let level1 = self.private_level1(pmap, inner);
        let l1_index = va.page_index(1);
        let level2 = self.memory.table(level1).entry(l1_index).address();

        if self.pages.del_ref(level2) > 0 {
            return;
        }

        self.memory.table(level1).clear_entry(l1_index);
        inner.stats.level2_tables -= 1;
        self.free_table_page(level2);
        self.delref_level1(pmap, inner, tlb);
    }

    /// Drops one reference to the private level-1 table.
    ///
    /// At zero the table is destroyed right away unless another processor runs the
    /// address space; then the last deactivation destroys it.
    pub(crate) fn delref_level1(
        &self,
        pmap: &Arc<Pmap>,
        inner: &mut PmapInner,
        tlb: &mut TlbBatch<'_>,
    ) {
        let level1 = self.private_level1(pmap, inner);
        if self.pages.del_ref(level1) > 0 {
            return;
        }

        let cpu = tlb.cpu();
        if pmap.active.load().without(cpu).is_empty() {
            self.destroy_level1(pmap, inner, cpu);
        } else {
            log::debug!(
                "pmap {}: level-1 release deferred, active on {:?}",
                pmap.id(),
                pmap.active.load()
            );
        }
    }

    /// Returns an address space to the kernel template and frees its level-1 table.
    pub(crate) fn destroy_level1(&self, pmap: &Pmap, inner: &mut PmapInner, cpu: CpuId) {
        let Level1::Private(level1) = inner.level1 else {
            return;
        };
        assert_eq!(
            self.pages.refcount(level1),
            0,
            "destroying a level-1 table that still maps user tables"
        );

        inner.level1 = Level1::SharedTemplate;
        pmap.reset_asns();
        if pmap.is_active_on(cpu) {
            self.mmu.load_context(self.template, ASN_RESERVED);
        }
        self.free_table_page(level1);
        log::debug!("pmap {}: back on the kernel template", pmap.id());
    }

    fn private_level1(&self, pmap: &Pmap, inner: &PmapInner) -> PhysicalAddress {
        match inner.level1 {
            Level1::Private(level1) => level1,
            Level1::SharedTemplate => {
                panic!("pmap {} has no private tables to release", pmap.id())
            }
        }
    }

    /// Takes a level-3 table away from another address space and returns a free page.
    ///
    /// Address spaces are visited least recently activated first. The first level-3 table
    /// without wired mappings is emptied, which frees it, and the page is then taken from
    /// the frame allocator.
    fn steal_table_page(
        &self,
        requester: &Pmap,
        usage: PageUsage,
        tlb: &mut TlbBatch<'_>,
    ) -> Option<PhysicalAddress> {
        let cpu = tlb.cpu();
        let donors = self.pmaps();
        let mut visited = 0;

        for donor in &donors {
            if donor.is_kernel() || core::ptr::eq(&**donor, requester) {
                continue;
            }
            let Some(mut inner) = donor.inner.try_lock(cpu) else {
                continue;
            };
            let Level1::Private(level1) = inner.level1 else {
                continue;
            };

            let Some(victims) = self.find_unwired_level3(level1, &mut visited) else {
                continue;
            };
            for (va, slot) in victims {
                let pte = self.read_leaf(slot);
                self.remove_mapping(donor, &mut inner, va, slot, pte, PvLock::Acquire, tlb);
            }
            drop(inner);

            if let Some(page) = self.frames.alloc_page(usage) {
                log::warn!("stole a table page from pmap {} for pmap {}", donor.id(), requester.id());
                self.note_steal(StealKind::TablePage, visited, true);
                return Some(page);
            }
        }

        self.note_steal(StealKind::TablePage, visited, false);
        None
    }

    /// Finds the first level-3 table under `level1` with no wired mapping and returns its
    /// valid leaves.
    fn find_unwired_level3(
        &self,
        level1: PhysicalAddress,
        visited: &mut usize,
    ) -> Option<Vec<(VirtualAddress, LeafSlot)>> {
        let l1_table = self.memory.table(level1);
        for (l1_index, l1_entry) in l1_table.valid_entries(0..USER_L1_SLOTS) {
            let l2_table = self.memory.table(l1_entry.address());
            for (l2_index, l2_entry) in l2_table.valid_entries(0..ENTRIES_PER_TABLE) {
                *visited += 1;
                let level3 = l2_entry.address();
                let leaves: Vec<_> = self
                    .memory
                    .table(level3)
                    .valid_entries(0..ENTRIES_PER_TABLE)
                    .collect();
                if leaves.iter().any(|(_, leaf)| leaf.is_wired()) {
                    continue;
                }
                return Some(
                    leaves
                        .into_iter()
                        .map(|(index, _)| {
                            (
                                user_address(l1_index, l2_index, index),
                                LeafSlot {
                                    table: level3,
                                    index,
                                },
                            )
                        })
                        .collect(),
                );
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_slot_address() {
        let slot = LeafSlot {
            table: PhysicalAddress::new(0x4000),
            index: 3,
        };
        assert_eq!(slot.address(), PhysicalAddress::new(0x4018));
    }

    #[test]
    fn user_address_composes_indices() {
        let va = user_address(2, 3, 4);
        assert_eq!(va.page_index(1), 2);
        assert_eq!(va.page_index(2), 3);
        assert_eq!(va.page_index(3), 4);
    }
}
