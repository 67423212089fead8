//! Reference and modify emulation.
//!
//! The hardware keeps no referenced or modified bits. Mappings are entered with fault-on
//! bits instead, and the fault handler reports each such fault here. The first read of a
//! page records it as referenced, the first write as modified, and the fault bits are then
//! cleared on every mapping of the page.

use alloc::sync::Arc;

use crate::{
    PmapSystem, VirtualAddress,
    arch::PageFlags,
    page_meta::PageAttributes,
    pmap::{Level1, Pmap},
};

/// The access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    Execute,
}

impl FaultKind {
    /// Fault bits an access of this kind clears.
    fn clears(self) -> PageFlags {
        match self {
            Self::Write => PageFlags::FAULT_BITS,
            Self::Read | Self::Execute => PageFlags::FAULT_ON_READ | PageFlags::FAULT_ON_EXECUTE,
        }
    }

    fn records(self) -> PageAttributes {
        match self {
            Self::Write => PageAttributes::REFERENCED | PageAttributes::MODIFIED,
            Self::Read | Self::Execute => PageAttributes::REFERENCED,
        }
    }
}

impl PmapSystem {
    /// Handles a fault-on-read, fault-on-write or fault-on-execute trap at `va`.
    ///
    /// Kernel addresses are looked up in the kernel address space whatever `pmap` is.
    /// Returns true if the access was an execute of a mapping without execute permission,
    /// which the caller must treat as a protection violation.
    ///
    /// # Panics
    /// Panics on a user-mode access to a kernel address, or if `va` is not mapped.
    pub fn emulate_reference(
        &self,
        pmap: &Arc<Pmap>,
        va: VirtualAddress,
        kind: FaultKind,
        user: bool,
    ) -> bool {
        if user {
            assert!(va.is_user(), "user access to kernel address {va}");
        }
        let target = if va.is_user() { pmap } else { &self.kernel };
        let level1 = |inner_level1: Level1| {
            if va.is_user() {
                inner_level1
            } else {
                Level1::SharedTemplate
            }
        };

        let pte = {
            let inner = target.inner.lock(self.current_cpu());
            self.lookup_leaf(level1(inner.level1), va)
                .map(|slot| self.read_leaf(slot))
        };
        let Some(pte) = pte.filter(|pte| pte.is_valid()) else {
            panic!("emulate_reference: {va} not mapped in pmap {}", target.id());
        };

        if kind == FaultKind::Execute && !pte.flags().contains(PageFlags::EXECUTE) {
            return true;
        }

        let pa = pte.address();
        log::trace!("emulate_reference: {kind:?} at {va} -> {pa}");
        if let Some(meta) = self.pages.get(pa) {
            meta.set_attributes(kind.records());
            self.change_bits(pa, PageFlags::empty(), kind.clears());
            return false;
        }

        // Unmanaged pages have no attributes to record; just stop the faults.
        let _direction = self.pv_direction.read();
        let mut tlb = self.tlb();
        let inner = target.inner.lock(tlb.cpu());
        let Some(slot) = self.lookup_leaf(level1(inner.level1), va) else {
            return false;
        };
        let old = self.read_leaf(slot);
        if !old.is_valid() {
            return false;
        }
        let mut flags = old.flags().difference(kind.clears());
        if !flags.contains(PageFlags::EXECUTE) {
            flags |= PageFlags::FAULT_ON_EXECUTE;
        }
        if flags != old.flags() {
            self.write_leaf(slot, old.with_flags(flags));
            tlb.invalidate(target, va, old);
        }
        false
    }
}
