//! Reverse mappings.
//!
//! Each managed page keeps a list of the (address space, virtual address) pairs mapping it.
//! Page-wide operations walk that list and lock the address spaces they find, the reverse
//! of the usual order, so they hold the direction lock exclusively while doing it.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    FrameAllocator, PageMetaTable, PageUsage, PhysicalAddress, PmapError, PmapSystem,
    VirtualAddress,
    arch::PageFlags,
    page_meta::PageAttributes,
    page_table::LeafSlot,
    pmap::Pmap,
    protection::VmProt,
    system::StealKind,
    tlb::TlbBatch,
};

/// One mapping of a physical page.
#[derive(Clone)]
pub(crate) struct PvEntry {
    pub(crate) pmap: Arc<Pmap>,
    pub(crate) va: VirtualAddress,
    pub(crate) slot: LeafSlot,
}

/// The mappings of one physical page, most recent first.
pub struct PvList {
    entries: Vec<PvEntry>,
}

impl PvList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn insert_head(&mut self, entry: PvEntry) {
        self.entries.insert(0, entry);
    }

    /// Removes the entry of `pmap` at `va`.
    ///
    /// # Panics
    /// Panics if there is none.
    pub(crate) fn take(&mut self, pmap: &Pmap, va: VirtualAddress) -> PvEntry {
        let position = self
            .entries
            .iter()
            .position(|entry| core::ptr::eq(&*entry.pmap, pmap) && entry.va == va);
        match position {
            Some(position) => self.entries.remove(position),
            None => panic!("pv_remove: mapping of {va} by pmap {} not found", pmap.id()),
        }
    }

    pub(crate) fn contains(&self, pmap: &Pmap, va: VirtualAddress) -> bool {
        self.entries
            .iter()
            .any(|entry| core::ptr::eq(&*entry.pmap, pmap) && entry.va == va)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PvEntry> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PvList {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the caller already holds the list lock of the page being unmapped.
pub(crate) enum PvLock<'a> {
    Acquire,
    Held(&'a mut PvList),
}

struct PoolState {
    free: usize,
    in_use: usize,
    pages: Vec<PhysicalAddress>,
}

/// Occupancy of the reverse-mapping entry pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PvPoolStats {
    pub pages: usize,
    pub in_use: usize,
    pub free: usize,
}

/// Accounting for reverse-mapping entries.
///
/// Entries are carved out of whole pages taken from the frame allocator, up to a fixed
/// number of pages. Pages are kept once taken.
pub(crate) struct PvPool {
    per_page: usize,
    max_pages: usize,
    state: spin::Mutex<PoolState>,
}

impl PvPool {
    pub(crate) fn new(per_page: usize, max_pages: usize) -> Self {
        assert!(per_page > 0, "pv pool pages must hold at least one entry");
        Self {
            per_page,
            max_pages,
            state: spin::Mutex::new(PoolState {
                free: 0,
                in_use: 0,
                pages: Vec::new(),
            }),
        }
    }

    /// Takes one entry, growing the pool by a page if allowed. Returns false when the pool
    /// is exhausted.
    pub(crate) fn try_alloc(&self, frames: &dyn FrameAllocator, pages: &PageMetaTable) -> bool {
        let mut state = self.state.lock();
        if state.free == 0 {
            if state.pages.len() >= self.max_pages {
                return false;
            }
            let Some(page) = frames.alloc_page(PageUsage::PvPool) else {
                return false;
            };
            pages.set_usage(page, PageUsage::PvPool);
            state.pages.push(page);
            state.free += self.per_page;
            log::debug!("pv pool grew to {} pages", state.pages.len());
        }
        state.free -= 1;
        state.in_use += 1;
        true
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        assert!(state.in_use > 0, "pv pool over-released");
        state.in_use -= 1;
        state.free += 1;
    }

    pub(crate) fn stats(&self) -> PvPoolStats {
        let state = self.state.lock();
        PvPoolStats {
            pages: state.pages.len(),
            in_use: state.in_use,
            free: state.free,
        }
    }
}

impl PmapSystem {
    /// Records that `pmap` maps `pa` at `va` through `slot`.
    ///
    /// The caller holds the direction lock shared and the lock of `pmap`.
    pub(crate) fn pv_enter(
        &self,
        pmap: &Arc<Pmap>,
        pa: PhysicalAddress,
        va: VirtualAddress,
        slot: LeafSlot,
        tlb: &mut TlbBatch<'_>,
    ) -> Result<(), PmapError> {
        self.pv_alloc(pmap, tlb)?;

        let mut list = self.pages.page(pa).pv.lock();
        #[cfg(any(test, feature = "debug-checks"))]
        assert!(
            !list.contains(pmap, va),
            "duplicate pv entry for {va} in pmap {}",
            pmap.id()
        );
        list.insert_head(PvEntry {
            pmap: pmap.clone(),
            va,
            slot,
        });
        log::trace!("pv: {pa} mapped at {va} by pmap {}", pmap.id());
        Ok(())
    }

    fn pv_alloc(&self, requester: &Pmap, tlb: &mut TlbBatch<'_>) -> Result<(), PmapError> {
        loop {
            if self.pv_pool.try_alloc(&*self.frames, &self.pages) {
                return Ok(());
            }
            if !self.steal_pv_entry(requester, tlb) {
                return Err(PmapError::OutOfMemory);
            }
        }
    }

    /// Frees a pool entry by removing some other address space's unwired mapping.
    ///
    /// Every managed page is searched. Donors are only try-locked: this runs with the
    /// requester locked and a page list locked, so waiting could deadlock.
    fn steal_pv_entry(&self, requester: &Pmap, tlb: &mut TlbBatch<'_>) -> bool {
        let cpu = tlb.cpu();
        let mut visited = 0;

        for (pa, meta) in self.pages.iter() {
            let mut list = meta.pv.lock();
            let candidates: Vec<PvEntry> = list
                .iter()
                .filter(|entry| {
                    !entry.pmap.is_kernel() && !core::ptr::eq(&*entry.pmap, requester)
                })
                .cloned()
                .collect();

            for candidate in candidates {
                visited += 1;
                let Some(mut inner) = candidate.pmap.inner.try_lock(cpu) else {
                    continue;
                };
                let pte = self.read_leaf(candidate.slot);
                if pte.is_wired() {
                    continue;
                }
                self.remove_mapping(
                    &candidate.pmap,
                    &mut inner,
                    candidate.va,
                    candidate.slot,
                    pte,
                    PvLock::Held(&mut *list),
                    tlb,
                );
                log::warn!(
                    "stole the mapping of {pa} at {} from pmap {} for pmap {}",
                    candidate.va,
                    candidate.pmap.id(),
                    requester.id()
                );
                self.note_steal(StealKind::PvEntry, visited, true);
                return true;
            }
        }

        self.note_steal(StealKind::PvEntry, visited, false);
        false
    }

    /// Occupancy of the reverse-mapping entry pool.
    pub fn pv_pool_stats(&self) -> PvPoolStats {
        self.pv_pool.stats()
    }

    /// Lowers the protection of every mapping of `pa` to at most `prot`.
    ///
    /// Read-write and full protection change nothing. Read-only protections take write
    /// permission away; anything without read removes every unwired mapping.
    pub fn page_protect(&self, pa: PhysicalAddress, prot: VmProt) {
        if !prot.contains(VmProt::READ) {
            self.page_protect_remove_all(pa);
        } else if !prot.contains(VmProt::WRITE) {
            self.page_protect_downgrade(pa, false);
        }
    }

    /// Takes write permission away from every mapping of `pa`, or with `keep_write`
    /// takes execute permission away instead.
    pub fn page_protect_downgrade(&self, pa: PhysicalAddress, keep_write: bool) {
        if keep_write {
            self.change_bits(pa, PageFlags::empty(), PageFlags::EXECUTE);
        } else {
            self.change_bits(pa, PageFlags::empty(), PageFlags::WRITE_ENABLE);
        }
    }

    /// Removes every unwired mapping of `pa`.
    pub fn page_protect_remove_all(&self, pa: PhysicalAddress) {
        let Some(meta) = self.pages.get(pa) else {
            return;
        };
        let _direction = self.pv_direction.write();
        let mut tlb = self.tlb();
        let cpu = tlb.cpu();

        let entries: Vec<PvEntry> = meta.pv.lock().iter().cloned().collect();
        for entry in entries {
            let Some(mut inner) = entry.pmap.inner.lock_unless_held(cpu) else {
                continue;
            };
            let pte = self.read_leaf(entry.slot);
            if pte.is_wired() {
                log::warn!(
                    "page_protect: keeping wired mapping of {pa} at {} in pmap {}",
                    entry.va,
                    entry.pmap.id()
                );
                continue;
            }
            self.remove_mapping(
                &entry.pmap,
                &mut inner,
                entry.va,
                entry.slot,
                pte,
                PvLock::Acquire,
                &mut tlb,
            );
        }
    }

    /// Sets and clears entry bits on every mapping of `pa`.
    ///
    /// An entry without execute permission always keeps faulting on execute.
    pub(crate) fn change_bits(&self, pa: PhysicalAddress, set: PageFlags, clear: PageFlags) {
        let Some(meta) = self.pages.get(pa) else {
            return;
        };
        let _direction = self.pv_direction.write();
        let mut tlb = self.tlb();
        let cpu = tlb.cpu();

        let entries: Vec<PvEntry> = meta.pv.lock().iter().cloned().collect();
        for entry in entries {
            let Some(_inner) = entry.pmap.inner.lock_unless_held(cpu) else {
                continue;
            };
            let old = self.read_leaf(entry.slot);
            let mut flags = old.flags().union(set).difference(clear);
            if !flags.contains(PageFlags::EXECUTE) {
                flags |= PageFlags::FAULT_ON_EXECUTE;
            }
            if flags != old.flags() {
                self.write_leaf(entry.slot, old.with_flags(flags));
                tlb.invalidate(&entry.pmap, entry.va, old);
            }
        }
    }

    pub fn is_referenced(&self, pa: PhysicalAddress) -> bool {
        self.pages
            .get(pa)
            .is_some_and(|meta| meta.attributes().contains(PageAttributes::REFERENCED))
    }

    pub fn is_modified(&self, pa: PhysicalAddress) -> bool {
        self.pages
            .get(pa)
            .is_some_and(|meta| meta.attributes().contains(PageAttributes::MODIFIED))
    }

    /// Clears the referenced attribute of `pa` and re-arms every fault that records it.
    /// Returns whether the page was referenced.
    pub fn clear_referenced(&self, pa: PhysicalAddress) -> bool {
        let Some(meta) = self.pages.get(pa) else {
            return false;
        };
        let was = meta.clear_attributes(PageAttributes::REFERENCED);
        if was {
            self.change_bits(pa, PageFlags::FAULT_BITS, PageFlags::empty());
        }
        was
    }

    /// Clears the modified attribute of `pa` and makes the next write fault again.
    /// Returns whether the page was modified.
    pub fn clear_modified(&self, pa: PhysicalAddress) -> bool {
        let Some(meta) = self.pages.get(pa) else {
            return false;
        };
        let was = meta.clear_attributes(PageAttributes::MODIFIED);
        if was {
            self.change_bits(pa, PageFlags::FAULT_ON_WRITE, PageFlags::empty());
        }
        was
    }

    /// Marks `pa` referenced without waiting for a fault.
    pub fn mark_referenced(&self, pa: PhysicalAddress) {
        let Some(meta) = self.pages.get(pa) else {
            return;
        };
        meta.set_attributes(PageAttributes::REFERENCED);
        self.change_bits(
            pa,
            PageFlags::empty(),
            PageFlags::FAULT_ON_READ | PageFlags::FAULT_ON_EXECUTE,
        );
    }

    /// The (address space id, virtual address) pairs mapping `pa`, most recent first.
    pub fn pv_mappings(&self, pa: PhysicalAddress) -> Vec<(usize, VirtualAddress)> {
        self.pages.get(pa).map_or_else(Vec::new, |meta| {
            meta.pv
                .lock()
                .iter()
                .map(|entry| (entry.pmap.id(), entry.va))
                .collect()
        })
    }

    /// Logs the reverse mappings of `pa`.
    pub fn pv_dump(&self, pa: PhysicalAddress) {
        let Some(meta) = self.pages.get(pa) else {
            log::debug!("pv_dump: {pa} is not managed");
            return;
        };
        let list = meta.pv.lock();
        log::debug!(
            "pv_dump: {pa} usage {:?} attributes {:?}, {} mappings",
            meta.usage(),
            meta.attributes(),
            list.len()
        );
        for entry in list.iter() {
            log::debug!(
                "  pmap {} va {} entry {:?}",
                entry.pmap.id(),
                entry.va,
                self.read_leaf(entry.slot)
            );
        }
    }
}
