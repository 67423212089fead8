//! Scenarios on the emulated machine.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use crate::{
    EnterFlags, FaultKind, Level1, PageEntry, PageFlags, PhysicalAddress, Pmap, PmapConfig,
    VirtualAddress, VmProt,
    arch::{PAGE_SIZE, VM_MAX_USER_ADDRESS, VM_MIN_KERNEL_ADDRESS},
    testing::{TestMachine, data_page, unmanaged_page, va},
};

const RW: VmProt = VmProt::READ.union(VmProt::WRITE);

fn leaf(m: &TestMachine, pmap: &Pmap, address: usize) -> PageEntry {
    let level1 = if VirtualAddress::new(address).is_user() {
        pmap.level1(m.sys.current_cpu())
    } else {
        Level1::SharedTemplate
    };
    let slot = m
        .sys
        .lookup_leaf(level1, va(address))
        .expect("no tables for address");
    m.sys.read_leaf(slot)
}

impl TestMachine {
    fn enter(&self, pmap: &Arc<Pmap>, address: usize, pa: PhysicalAddress, prot: VmProt) {
        self.sys
            .enter(pmap, va(address), pa, prot, EnterFlags::empty())
            .expect("enter failed");
    }

    fn enter_wired(&self, pmap: &Arc<Pmap>, address: usize, pa: PhysicalAddress) {
        self.sys
            .enter(pmap, va(address), pa, RW, EnterFlags::WIRED)
            .expect("enter failed");
    }

    fn remove_all(&self, pmap: &Arc<Pmap>) {
        self.sys
            .remove_range(pmap, va(0), va(VM_MAX_USER_ADDRESS), true);
    }

    /// Every managed page has exactly one reverse mapping per valid tracked leaf.
    fn assert_pv_consistent(&self) {
        let mut expected: BTreeMap<PhysicalAddress, usize> = BTreeMap::new();
        for pmap in self.sys.pmaps() {
            let (level1, start, end) = if pmap.is_kernel() {
                (
                    self.sys.template(),
                    va(VM_MIN_KERNEL_ADDRESS),
                    self.sys.kernel_end(),
                )
            } else {
                match pmap.level1(0) {
                    Level1::SharedTemplate => continue,
                    Level1::Private(level1) => (level1, va(0), va(VM_MAX_USER_ADDRESS)),
                }
            };
            for (_, _, pte) in self.sys.valid_leaves(level1, start, end) {
                if pte.flags().contains(PageFlags::PV_LIST) {
                    *expected.entry(pte.address()).or_default() += 1;
                }
            }
        }
        for (pa, meta) in self.sys.pages().iter() {
            let listed = meta.pv.lock().len();
            assert_eq!(
                listed,
                expected.get(&pa).copied().unwrap_or(0),
                "pv list of {pa} out of step"
            );
        }
    }
}

mod mapping {
    use super::*;

    #[test]
    fn enter_then_extract() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();

        m.enter(&pmap, 0x2000, data_page(0), RW);
        assert_eq!(m.sys.extract(&pmap, va(0x2000)), Some(PhysicalAddress::new(0x1000)));
        assert_eq!(m.sys.extract(&pmap, va(0x2010)), Some(PhysicalAddress::new(0x1010)));
        assert_eq!(pmap.resident_count(0), 1);

        m.sys.remove_range(&pmap, va(0x2000), va(0x3000), false);
        assert_eq!(m.sys.extract(&pmap, va(0x2000)), None);
        assert_eq!(pmap.resident_count(0), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.enter(&pmap, 0x5000, data_page(1), RW);

        m.sys.remove_range(&pmap, va(0x2000), va(0x3000), false);
        let stats = pmap.stats(0);
        m.sys.remove_range(&pmap, va(0x2000), va(0x3000), false);
        assert_eq!(pmap.stats(0), stats);
        assert_eq!(m.sys.extract(&pmap, va(0x5000)), Some(data_page(1)));
    }

    #[test]
    fn remap_replaces_mapping() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();

        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.enter(&pmap, 0x2000, data_page(4), RW);

        assert_eq!(pmap.resident_count(0), 1);
        assert_eq!(m.sys.extract(&pmap, va(0x2000)), Some(data_page(4)));
        assert!(m.sys.pv_mappings(data_page(0)).is_empty());
        assert_eq!(
            m.sys.pv_mappings(data_page(4)),
            [(pmap.id(), va(0x2000))]
        );
        assert_eq!(pmap.stats(0).level3_tables, 1);
        m.assert_pv_consistent();
    }

    #[test]
    fn reenter_same_page_updates_protection() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();

        m.enter(&pmap, 0x2000, data_page(0), VmProt::READ);
        assert!(!leaf(&m, &pmap, 0x2000).flags().contains(PageFlags::USER_WRITE));

        m.enter(&pmap, 0x2000, data_page(0), RW);
        assert!(leaf(&m, &pmap, 0x2000).flags().contains(PageFlags::USER_WRITE));
        assert_eq!(pmap.resident_count(0), 1);
        assert_eq!(m.sys.pv_mappings(data_page(0)).len(), 1);
    }

    #[test]
    fn wired_mappings_survive_unwired_removal() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter_wired(&pmap, 0x2000, data_page(0));
        assert_eq!(pmap.wired_count(0), 1);

        m.sys.remove_range(&pmap, va(0), va(0x10_0000), false);
        assert_eq!(m.sys.extract(&pmap, va(0x2000)), Some(data_page(0)));

        m.sys.remove_range(&pmap, va(0), va(0x10_0000), true);
        assert_eq!(m.sys.extract(&pmap, va(0x2000)), None);
        assert_eq!(pmap.wired_count(0), 0);
    }

    #[test]
    fn unwire_allows_removal() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter_wired(&pmap, 0x2000, data_page(0));

        m.sys.unwire(&pmap, va(0x2000));
        assert_eq!(pmap.wired_count(0), 0);
        assert!(!leaf(&m, &pmap, 0x2000).is_wired());

        m.sys.remove_range(&pmap, va(0x2000), va(0x3000), false);
        assert_eq!(m.sys.extract(&pmap, va(0x2000)), None);
    }

    #[test]
    fn change_wiring_counts() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);

        m.sys.change_wiring(&pmap, va(0x2000), true);
        m.sys.change_wiring(&pmap, va(0x2000), true);
        assert_eq!(pmap.wired_count(0), 1);
    }

    #[test]
    #[should_panic(expected = "change_wiring")]
    fn unwire_unmapped_panics() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.sys.unwire(&pmap, va(0x2000));
    }

    #[test]
    #[should_panic(expected = "user mapping at non-user address")]
    fn user_enter_of_kernel_address_panics() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, VM_MIN_KERNEL_ADDRESS, data_page(0), RW);
    }

    #[test]
    fn extract_direct_mapped() {
        let m = TestMachine::new(1, 63);
        let k0 = data_page(3).to_k0seg() + 0x18;
        assert_eq!(
            m.sys.extract(m.sys.kernel_pmap(), k0),
            Some(data_page(3) + 0x18)
        );
    }

    #[test]
    fn unmanaged_pages_have_no_reverse_mapping() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, unmanaged_page(0), RW);

        let flags = leaf(&m, &pmap, 0x2000).flags();
        assert!(!flags.contains(PageFlags::PV_LIST));
        assert!(!flags.contains(PageFlags::FAULT_ON_READ));
        assert_eq!(m.sys.pv_pool_stats().in_use, 0);
        m.remove_all(&pmap);
        assert_eq!(pmap.level1(0), Level1::SharedTemplate);
    }

    #[test]
    fn tables_are_freed_with_last_mapping() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        let baseline = m.frames.outstanding();

        // One mapping under each of two level-1 slots and two level-2 slots.
        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.enter(&pmap, 0x40_0000, data_page(1), RW);
        m.enter(&pmap, 0x4000_0000, data_page(2), RW);
        let stats = pmap.stats(0);
        assert_eq!(stats.level2_tables, 2);
        assert_eq!(stats.level3_tables, 3);
        m.assert_pv_consistent();

        m.remove_all(&pmap);
        let stats = pmap.stats(0);
        assert_eq!(stats.level2_tables, 0);
        assert_eq!(stats.level3_tables, 0);
        assert_eq!(pmap.level1(0), Level1::SharedTemplate);
        // Only the reverse-mapping pool page stays allocated.
        assert_eq!(
            m.frames.outstanding(),
            baseline + m.sys.pv_pool_stats().pages
        );
        m.assert_pv_consistent();
    }

    #[test]
    fn shared_page_lists_every_mapper() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        let b = m.sys.create();

        m.enter(&a, 0x2000, data_page(0), RW);
        m.enter(&b, 0x7000, data_page(0), VmProt::READ);
        m.enter(&a, 0x3000, data_page(0), RW);
        assert_eq!(m.sys.pv_mappings(data_page(0)).len(), 3);
        m.sys.pv_dump(data_page(0));
        m.assert_pv_consistent();

        m.sys.remove_range(&a, va(0x2000), va(0x3000), false);
        assert_eq!(
            m.sys.pv_mappings(data_page(0)),
            [(a.id(), va(0x3000)), (b.id(), va(0x7000))]
        );
        m.assert_pv_consistent();
    }

    #[test]
    fn collect_skips_wired_and_active() {
        let m = TestMachine::new(1, 63);
        let idle = m.sys.create();
        m.enter_wired(&idle, 0x2000, data_page(0));
        m.enter(&idle, 0x3000, data_page(1), RW);

        assert!(m.sys.collect(&idle));
        assert_eq!(m.sys.extract(&idle, va(0x2000)), Some(data_page(0)));
        assert_eq!(m.sys.extract(&idle, va(0x3000)), None);

        let running = m.sys.create();
        m.enter(&running, 0x3000, data_page(1), RW);
        m.sys.activate(&running, 0);
        assert!(!m.sys.collect(&running));
        assert!(!m.sys.collect(m.sys.kernel_pmap()));
        assert_eq!(m.sys.extract(&running, va(0x3000)), Some(data_page(1)));
    }

    #[test]
    #[should_panic(expected = "map_range: ")]
    fn kernel_map_range_out_of_memory_panics() {
        let m = TestMachine::new(1, 63);
        m.frames.exhaust();
        m.sys
            .map_range(va(VM_MIN_KERNEL_ADDRESS), data_page(0), data_page(2), RW);
    }

    #[test]
    fn kernel_map_range() {
        let m = TestMachine::new(1, 63);
        let start = va(VM_MIN_KERNEL_ADDRESS);
        let end = m.sys.map_range(start, data_page(0), data_page(3), RW);

        assert_eq!(end, start + 3 * PAGE_SIZE);
        let kernel = m.sys.kernel_pmap();
        assert_eq!(m.sys.extract(kernel, start + PAGE_SIZE), Some(data_page(1)));
        assert_eq!(kernel.wired_count(0), 3);
        assert!(leaf(&m, kernel, start.as_usize()).flags().is_global());

        m.sys.remove_range(kernel, start, end, true);
        assert_eq!(m.sys.extract(kernel, start), None);
        assert_eq!(kernel.resident_count(0), 0);
        m.assert_pv_consistent();
    }

    #[test]
    #[should_panic(expected = "beyond the grown kernel range")]
    fn kernel_enter_beyond_range_panics() {
        let m = TestMachine::new(1, 63);
        let end = m.sys.kernel_end();
        let _ = m.sys.enter(m.sys.kernel_pmap(), end, data_page(0), RW, EnterFlags::WIRED);
    }

    #[test]
    fn zero_and_copy_pages() {
        let m = TestMachine::new(1, 63);
        let memory = m.sys.memory().emulated_memory().expect("emulated");
        memory.write_u64(data_page(0) + 8, 0xdead_beef);

        m.sys.copy_page(data_page(0), data_page(1));
        assert_eq!(memory.read_u64(data_page(1) + 8), 0xdead_beef);

        m.sys.zero_page(data_page(1));
        assert_eq!(memory.read_u64(data_page(1) + 8), 0);
    }
}

mod protection {
    use super::*;

    #[test]
    fn unchanged_protection_is_silent() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.sys.activate(&pmap, 0);
        m.enter(&pmap, 0x2000, data_page(0), RW);

        let before = m.mmu.counters(0);
        let asn = pmap.asn(0);
        m.sys.change_protection(&pmap, va(0x2000), va(0x3000), RW);
        assert_eq!(m.mmu.counters(0), before);
        assert_eq!(pmap.asn(0), asn);

        m.sys.change_protection(&pmap, va(0x2000), va(0x3000), VmProt::READ);
        assert_eq!(m.mmu.counters(0).single, before.single + 1);
        let flags = leaf(&m, &pmap, 0x2000).flags();
        assert!(!flags.intersects(PageFlags::WRITE_ENABLE));
        assert!(flags.contains(PageFlags::FAULT_ON_EXECUTE));
    }

    #[test]
    fn protection_without_read_removes() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter_wired(&pmap, 0x2000, data_page(0));

        m.sys.change_protection(&pmap, va(0x2000), va(0x3000), VmProt::NONE);
        assert_eq!(m.sys.extract(&pmap, va(0x2000)), None);
        assert_eq!(pmap.wired_count(0), 0);
    }

    #[test]
    fn execute_grant_sets_exec_and_flags_isync() {
        let m = TestMachine::new(2, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), VmProt::READ);
        assert!(pmap.needs_isync.load().is_empty());

        m.sys.change_protection(&pmap, va(0x2000), va(0x3000), VmProt::READ | VmProt::EXECUTE);
        assert!(leaf(&m, &pmap, 0x2000).flags().contains(PageFlags::EXECUTE));
        assert_eq!(pmap.needs_isync.load().len(), 2);

        let icache = m.mmu.counters(0).icache;
        m.sys.sync_icache_on_return(&pmap, 0);
        m.sys.sync_icache_on_return(&pmap, 0);
        assert_eq!(m.mmu.counters(0).icache, icache + 1);
    }

    #[test]
    fn page_protect_read_only() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        let b = m.sys.create();
        m.enter(&a, 0x2000, data_page(0), RW);
        m.enter(&b, 0x2000, data_page(0), RW);

        m.sys.page_protect(data_page(0), VmProt::READ);
        assert!(!leaf(&m, &a, 0x2000).flags().intersects(PageFlags::WRITE_ENABLE));
        assert!(!leaf(&m, &b, 0x2000).flags().intersects(PageFlags::WRITE_ENABLE));
        assert_eq!(m.sys.pv_mappings(data_page(0)).len(), 2);
    }

    #[test]
    fn page_protect_none_keeps_wired() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        let b = m.sys.create();
        m.enter_wired(&a, 0x2000, data_page(0));
        m.enter(&b, 0x2000, data_page(0), RW);

        m.sys.page_protect(data_page(0), VmProt::NONE);
        assert_eq!(m.sys.pv_mappings(data_page(0)), [(a.id(), va(0x2000))]);
        assert_eq!(m.sys.extract(&b, va(0x2000)), None);
        assert_eq!(b.level1(0), Level1::SharedTemplate);
        m.assert_pv_consistent();
    }

    #[test]
    fn page_protect_read_write_changes_nothing() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), VmProt::ALL);
        m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Execute, true);
        let before = leaf(&m, &pmap, 0x2000).flags();
        assert!(before.contains(PageFlags::EXECUTE));

        m.sys.page_protect(data_page(0), VmProt::ALL);
        m.sys.page_protect(data_page(0), RW);
        assert_eq!(leaf(&m, &pmap, 0x2000).flags(), before);
    }

    #[test]
    fn page_protect_without_read_removes() {
        for prot in [VmProt::WRITE | VmProt::EXECUTE, VmProt::WRITE, VmProt::EXECUTE] {
            let m = TestMachine::new(1, 63);
            let pmap = m.sys.create();
            m.enter(&pmap, 0x2000, data_page(0), RW);

            m.sys.page_protect(data_page(0), prot);
            assert_eq!(m.sys.extract(&pmap, va(0x2000)), None, "{prot:?}");
            assert!(m.sys.pv_mappings(data_page(0)).is_empty());
            m.assert_pv_consistent();
        }
    }
}

mod emulation {
    use super::*;

    #[test]
    fn new_mappings_fault_on_everything() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        assert!(leaf(&m, &pmap, 0x2000).flags().contains(PageFlags::FAULT_BITS));
        assert!(!m.sys.is_referenced(data_page(0)));
    }

    #[test]
    fn read_then_write() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);

        assert!(!m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Read, true));
        assert!(m.sys.is_referenced(data_page(0)));
        assert!(!m.sys.is_modified(data_page(0)));
        let flags = leaf(&m, &pmap, 0x2000).flags();
        assert!(!flags.contains(PageFlags::FAULT_ON_READ));
        assert!(flags.contains(PageFlags::FAULT_ON_WRITE));
        assert!(flags.contains(PageFlags::FAULT_ON_EXECUTE));

        assert!(!m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Write, true));
        assert!(m.sys.is_modified(data_page(0)));
        let flags = leaf(&m, &pmap, 0x2000).flags();
        assert!(!flags.intersects(PageFlags::FAULT_ON_READ | PageFlags::FAULT_ON_WRITE));
        assert!(flags.contains(PageFlags::FAULT_ON_EXECUTE));
    }

    #[test]
    fn faults_clear_every_mapping() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        let b = m.sys.create();
        m.enter(&a, 0x2000, data_page(0), RW);
        m.enter(&b, 0x9000, data_page(0), RW);

        m.sys.emulate_reference(&a, va(0x2000), FaultKind::Write, true);
        assert!(!leaf(&m, &b, 0x9000).flags().contains(PageFlags::FAULT_ON_WRITE));
    }

    #[test]
    fn execute_without_permission_is_reported() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        assert!(m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Execute, true));
        assert!(!m.sys.is_referenced(data_page(0)));
    }

    #[test]
    fn execute_with_permission_clears_fault() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), VmProt::READ | VmProt::EXECUTE);

        assert!(!m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Execute, true));
        let flags = leaf(&m, &pmap, 0x2000).flags();
        assert!(!flags.intersects(PageFlags::FAULT_ON_READ | PageFlags::FAULT_ON_EXECUTE));
    }

    #[test]
    fn clearing_attributes_rearms_faults() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Write, true);

        assert!(m.sys.clear_modified(data_page(0)));
        assert!(!m.sys.clear_modified(data_page(0)));
        assert!(m.sys.is_referenced(data_page(0)));
        let flags = leaf(&m, &pmap, 0x2000).flags();
        assert!(flags.contains(PageFlags::FAULT_ON_WRITE));
        assert!(!flags.contains(PageFlags::FAULT_ON_READ));

        assert!(m.sys.clear_referenced(data_page(0)));
        assert!(!m.sys.is_referenced(data_page(0)));
        assert!(leaf(&m, &pmap, 0x2000).flags().contains(PageFlags::FAULT_BITS));
    }

    #[test]
    fn mark_referenced_stops_read_faults() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);

        m.sys.mark_referenced(data_page(0));
        assert!(m.sys.is_referenced(data_page(0)));
        let flags = leaf(&m, &pmap, 0x2000).flags();
        assert!(!flags.contains(PageFlags::FAULT_ON_READ));
        assert!(flags.contains(PageFlags::FAULT_ON_WRITE));
    }

    #[test]
    fn known_attributes_apply_to_new_mappings() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Write, true);

        m.enter(&pmap, 0x3000, data_page(0), RW);
        let flags = leaf(&m, &pmap, 0x3000).flags();
        assert!(!flags.intersects(PageFlags::FAULT_ON_READ | PageFlags::FAULT_ON_WRITE));

        m.sys.clear_modified(data_page(0));
        m.enter(&pmap, 0x4000, data_page(0), RW);
        let flags = leaf(&m, &pmap, 0x4000).flags();
        assert!(!flags.contains(PageFlags::FAULT_ON_READ));
        assert!(flags.contains(PageFlags::FAULT_ON_WRITE));
    }

    #[test]
    fn kernel_address_uses_kernel_pmap() {
        let m = TestMachine::new(1, 63);
        let user = m.sys.create();
        let kva = VM_MIN_KERNEL_ADDRESS + 4 * PAGE_SIZE;
        m.sys
            .enter(m.sys.kernel_pmap(), va(kva), data_page(2), RW, EnterFlags::WIRED)
            .expect("enter failed");

        assert!(!m.sys.emulate_reference(&user, va(kva), FaultKind::Read, false));
        assert!(m.sys.is_referenced(data_page(2)));
    }

    #[test]
    fn unmanaged_page_fault_is_absorbed() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, unmanaged_page(0), RW);
        assert!(!m.sys.emulate_reference(&pmap, va(0x2000), FaultKind::Write, true));
    }

    #[test]
    #[should_panic(expected = "user access to kernel address")]
    fn user_access_to_kernel_panics() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.sys
            .emulate_reference(&pmap, va(VM_MIN_KERNEL_ADDRESS), FaultKind::Read, true);
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn fault_on_unmapped_panics() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.sys.emulate_reference(&pmap, va(0x3000), FaultKind::Read, true);
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn destroy_unlinks() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.sys.reference(&pmap);

        m.sys.destroy(&pmap);
        assert!(m.sys.pmaps().iter().any(|other| Arc::ptr_eq(other, &pmap)));
        m.sys.destroy(&pmap);
        assert!(!m.sys.pmaps().iter().any(|other| Arc::ptr_eq(other, &pmap)));
    }

    #[test]
    #[should_panic(expected = "destroyed with valid mappings")]
    fn destroy_with_mappings_panics() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.sys.destroy(&pmap);
    }

    #[test]
    fn activation_moves_to_tail() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        let b = m.sys.create();
        m.sys.activate(&a, 0);

        let pmaps = m.sys.pmaps();
        assert!(Arc::ptr_eq(pmaps.last().expect("pmaps"), &a));
        assert!(pmaps.iter().any(|other| Arc::ptr_eq(other, &b)));
    }

    #[test]
    fn template_pmap_runs_with_reserved_asn() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.sys.activate(&pmap, 0);
        assert_eq!(m.mmu.context(0), Some((m.sys.template(), 0)));

        // The first mapping gives it a private table and an ASN while it runs.
        m.enter(&pmap, 0x2000, data_page(0), RW);
        let Level1::Private(level1) = pmap.level1(0) else {
            panic!("expected a private level-1 table");
        };
        assert_eq!(m.mmu.context(0), Some((level1, 1)));
        assert_eq!(m.translate(va(0x2000)), Some(data_page(0)));

        // Removing it puts the processor back on the template.
        m.remove_all(&pmap);
        assert_eq!(pmap.level1(0), Level1::SharedTemplate);
        assert_eq!(m.mmu.context(0), Some((m.sys.template(), 0)));
        assert_eq!(pmap.asn(0).0, 0);
    }

    #[test]
    fn private_table_maps_itself() {
        let m = TestMachine::new(1, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        let Level1::Private(level1) = pmap.level1(0) else {
            panic!("expected a private level-1 table");
        };
        let table = m.sys.memory().table(level1);
        let template = m.sys.memory().table(m.sys.template());

        let vpt = table.entry(crate::arch::VPT_INDEX);
        assert_eq!(vpt.address(), level1);
        assert!(!vpt.flags().is_global());
        let kernel = crate::arch::KERNEL_L1_FIRST;
        assert_eq!(table.entry(kernel), template.entry(kernel));
    }
}

mod asn {
    use super::*;

    fn mapped(m: &TestMachine) -> Arc<Pmap> {
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        pmap
    }

    #[test]
    fn rollover_bumps_generation() {
        let m = TestMachine::new(1, 2);
        let a = mapped(&m);
        let b = mapped(&m);
        let c = mapped(&m);

        m.sys.activate(&a, 0);
        m.sys.deactivate(&a, 0);
        m.sys.activate(&b, 0);
        m.sys.deactivate(&b, 0);
        assert_eq!(m.mmu.counters(0).user, 0);

        m.sys.activate(&c, 0);
        assert_eq!(c.asn(0), (1, 2));
        assert_eq!(a.asn(0), (1, 1));
        assert_eq!(m.mmu.counters(0).user, 1);
        m.sys.check_asn_exclusive();

        m.sys.deactivate(&c, 0);
        m.sys.activate(&a, 0);
        assert_eq!(a.asn(0), (2, 2));
        m.sys.check_asn_exclusive();
    }

    #[test]
    fn inactive_invalidation_forgets_asn() {
        let m = TestMachine::new(1, 63);
        let pmap = mapped(&m);
        m.sys.activate(&pmap, 0);
        m.sys.deactivate(&pmap, 0);
        assert_eq!(pmap.asn(0), (1, 1));

        m.enter(&pmap, 0x3000, data_page(1), RW);
        assert_eq!(pmap.asn(0), (1, crate::asn::GENERATION_INVALID));

        // The next activation draws a new tag instead of flushing.
        let user_flushes = m.mmu.counters(0).user;
        m.sys.activate(&pmap, 0);
        assert_eq!(pmap.asn(0), (2, 1));
        assert_eq!(m.mmu.counters(0).user, user_flushes);
    }

    #[test]
    fn untagged_mmu_uses_reserved_asn() {
        let m = TestMachine::new(1, 0);
        let pmap = mapped(&m);
        m.sys.activate(&pmap, 0);
        assert_eq!(pmap.asn(0).0, 0);
        assert_eq!(m.translate(va(0x2000)), Some(data_page(0)));
    }
}

#[cfg(feature = "multiprocessor")]
mod shootdown {
    use super::*;
    use crate::Ipi;

    #[test]
    fn remote_processor_drops_stale_translation() {
        let m = TestMachine::new(2, 63);
        let pmap = m.sys.create();
        m.on_cpu(1);
        m.sys.activate(&pmap, 1);
        m.on_cpu(0);
        m.sys.activate(&pmap, 0);

        m.enter(&pmap, 0x2000, data_page(0), RW);
        assert_eq!(m.mmu.take_ipis(1), [Ipi::Shootdown]);
        assert!(m.mmu.take_ipis(0).is_empty());

        m.on_cpu(1);
        m.sys.handle_ipi(Ipi::Shootdown);
        assert_eq!(m.translate(va(0x2000)), Some(data_page(0)));

        m.on_cpu(0);
        m.enter(&pmap, 0x2000, data_page(1), RW);

        m.on_cpu(1);
        // Until the interrupt is taken the old translation is still cached.
        assert_eq!(m.translate(va(0x2000)), Some(data_page(0)));
        assert_eq!(m.mmu.take_ipis(1), [Ipi::Shootdown]);
        m.sys.handle_ipi(Ipi::Shootdown);
        assert_eq!(m.translate(va(0x2000)), Some(data_page(1)));
        m.sys.check_asn_exclusive();
    }

    #[test]
    fn untouched_processors_are_not_signalled() {
        let m = TestMachine::new(3, 63);
        let pmap = m.sys.create();
        m.sys.activate(&pmap, 0);
        m.enter(&pmap, 0x2000, data_page(0), RW);

        assert!(m.mmu.take_ipis(1).is_empty());
        assert!(m.mmu.take_ipis(2).is_empty());
        assert_eq!(m.sys.shootdown_queues().pending(1), 0);
    }

    #[test]
    fn processor_with_cached_asn_is_signalled() {
        let m = TestMachine::new(2, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);

        // Run it on cpu 1 for a while, then switch away.
        m.on_cpu(1);
        m.sys.activate(&pmap, 1);
        assert_eq!(m.translate(va(0x2000)), Some(data_page(0)));
        m.sys.deactivate(&pmap, 1);

        m.on_cpu(0);
        m.sys.remove_range(&pmap, va(0x2000), va(0x3000), false);
        assert_eq!(m.mmu.take_ipis(1), [Ipi::Shootdown]);

        m.on_cpu(1);
        m.sys.process_shootdown();
        assert_eq!(pmap.asn(1).1, crate::asn::GENERATION_INVALID);
    }

    #[test]
    fn kernel_changes_reach_every_processor() {
        let m = TestMachine::new(3, 63);
        let kernel = m.sys.kernel_pmap();
        let kva = va(VM_MIN_KERNEL_ADDRESS);
        m.sys
            .enter(kernel, kva, data_page(0), RW, EnterFlags::WIRED)
            .expect("enter failed");
        assert_eq!(m.translate(kva), Some(data_page(0)));

        m.mmu.take_ipis(1);
        m.mmu.take_ipis(2);
        m.sys.remove_range(kernel, kva, kva + PAGE_SIZE, true);
        assert!(!m.mmu.is_cached(0, kva, 0));
        assert_eq!(m.mmu.take_ipis(1), [Ipi::Shootdown]);
        assert_eq!(m.mmu.take_ipis(2), [Ipi::Shootdown]);
    }

    #[test]
    fn overflow_flushes_user_translations() {
        let m = TestMachine::new(2, 63);
        let pmap = m.sys.create();
        m.on_cpu(1);
        m.sys.activate(&pmap, 1);
        m.on_cpu(0);
        m.sys.activate(&pmap, 0);

        for page in 0..8 {
            m.enter(&pmap, 0x2000 + page * PAGE_SIZE, data_page(page), RW);
        }
        let queues = m.sys.shootdown_queues();
        assert!(queues.overflowed(1));
        assert_eq!(queues.pending(1), 0);

        m.on_cpu(1);
        m.sys.process_shootdown();
        let counters = m.mmu.counters(1);
        assert_eq!(counters.user, 1);
        assert_eq!(counters.single, 0);
        assert!(!m.sys.shootdown_queues().overflowed(1));
        assert_eq!(m.translate(va(0x2000 + 7 * PAGE_SIZE)), Some(data_page(7)));
    }

    #[test]
    fn untagged_mmu_only_signals_active() {
        let m = TestMachine::new(2, 0);
        let pmap = m.sys.create();
        m.sys.activate(&pmap, 0);
        m.enter(&pmap, 0x2000, data_page(0), RW);
        assert!(m.mmu.take_ipis(1).is_empty());

        m.on_cpu(1);
        m.sys.activate(&pmap, 1);
        m.on_cpu(0);
        m.enter(&pmap, 0x3000, data_page(1), RW);
        assert_eq!(m.mmu.take_ipis(1), [Ipi::Shootdown]);
    }

    #[test]
    fn deactivated_processor_leaves_freed_level1() {
        let m = TestMachine::new(2, 63);
        let pmap = m.sys.create();
        m.enter(&pmap, 0x2000, data_page(0), RW);
        let Level1::Private(level1) = pmap.level1(0) else {
            panic!("no private level-1 table after enter");
        };

        m.on_cpu(1);
        m.sys.activate(&pmap, 1);
        assert_eq!(m.mmu.context(1), Some((level1, 1)));
        m.sys.deactivate(&pmap, 1);
        assert_eq!(m.mmu.context(1), Some((m.sys.template(), 0)));

        m.on_cpu(0);
        m.sys.remove_range(&pmap, va(0x2000), va(0x3000), false);
        assert_eq!(pmap.level1(0), Level1::SharedTemplate);
        assert_eq!(m.mmu.context(1), Some((m.sys.template(), 0)));

        // Reuse the freed pages, then walk kernel space from cpu 1.
        let other = m.sys.create();
        m.enter(&other, 0x2000, data_page(1), RW);
        m.on_cpu(1);
        m.enter(m.sys.kernel_pmap(), VM_MIN_KERNEL_ADDRESS, data_page(2), RW);
        assert_eq!(m.translate(va(VM_MIN_KERNEL_ADDRESS)), Some(data_page(2)));
    }

    #[test]
    fn level1_release_waits_for_remote_deactivation() {
        let m = TestMachine::new(2, 63);
        let pmap = m.sys.create();
        m.on_cpu(1);
        m.sys.activate(&pmap, 1);
        m.on_cpu(0);
        let baseline = m.frames.outstanding();

        m.enter(&pmap, 0x2000, data_page(0), RW);
        m.sys.remove_range(&pmap, va(0x2000), va(0x3000), false);
        assert!(matches!(pmap.level1(0), Level1::Private(_)));
        let stats = pmap.stats(0);
        assert_eq!((stats.level2_tables, stats.level3_tables), (0, 0));

        m.on_cpu(1);
        m.sys.process_shootdown();
        m.sys.deactivate(&pmap, 1);
        assert_eq!(pmap.level1(1), Level1::SharedTemplate);
        assert_eq!(m.mmu.context(1), Some((m.sys.template(), 0)));
        assert_eq!(
            m.frames.outstanding(),
            baseline + m.sys.pv_pool_stats().pages
        );
    }

    #[test]
    fn instruction_sync_for_kernel_text() {
        let m = TestMachine::new(2, 63);
        let kva = va(VM_MIN_KERNEL_ADDRESS);
        m.sys
            .enter(m.sys.kernel_pmap(), kva, data_page(0), VmProt::ALL, EnterFlags::WIRED)
            .expect("enter failed");
        assert_eq!(m.mmu.counters(0).icache, 1);
        assert!(m.mmu.take_ipis(1).contains(&Ipi::InstructionSync));

        m.on_cpu(1);
        m.sys.handle_ipi(Ipi::InstructionSync);
        assert_eq!(m.mmu.counters(1).icache, 1);
    }
}

mod stealing {
    use super::*;

    #[test]
    fn pv_entry_stolen_from_other_pmap() {
        let config = PmapConfig {
            pv_entries_per_page: 1,
            pv_pool_max_pages: 1,
            ..PmapConfig::default()
        };
        let m = TestMachine::with_config(1, 63, config);
        let a = m.sys.create();
        let b = m.sys.create();

        m.enter(&b, 0x2000, data_page(0), RW);
        m.enter(&a, 0x2000, data_page(1), RW);

        assert_eq!(m.sys.extract(&b, va(0x2000)), None);
        assert_eq!(m.sys.extract(&a, va(0x2000)), Some(data_page(1)));
        assert_eq!(b.level1(0), Level1::SharedTemplate);
        assert_eq!(m.sys.steal_stats().pv_entries, 1);
        m.assert_pv_consistent();
    }

    #[test]
    fn wired_mappings_are_not_stolen() {
        let config = PmapConfig {
            pv_entries_per_page: 1,
            pv_pool_max_pages: 1,
            ..PmapConfig::default()
        };
        let m = TestMachine::with_config(1, 63, config);
        let a = m.sys.create();
        let b = m.sys.create();
        m.enter_wired(&b, 0x2000, data_page(0));

        let result = m
            .sys
            .enter(&a, va(0x2000), data_page(1), RW, EnterFlags::MAY_FAIL);
        assert_eq!(result, Err(crate::PmapError::OutOfMemory));
        assert_eq!(m.sys.extract(&b, va(0x2000)), Some(data_page(0)));
        // The failed enter released the tables it built.
        assert_eq!(a.level1(0), Level1::SharedTemplate);
        assert!(m.sys.steal_stats().candidates_scanned >= 1);
    }

    #[test]
    fn table_page_stolen_from_other_pmap() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        let b = m.sys.create();
        m.enter(&b, 0x2000, data_page(0), RW);
        m.frames.exhaust();

        m.enter(&a, 0x2000, data_page(1), RW);
        assert_eq!(m.sys.extract(&a, va(0x2000)), Some(data_page(1)));
        assert_eq!(m.sys.extract(&b, va(0x2000)), None);
        assert_eq!(m.sys.steal_stats().table_pages, 1);
        m.assert_pv_consistent();
    }

    #[test]
    fn exhaustion_without_donor_fails() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        m.frames.exhaust();

        let result = m
            .sys
            .enter(&a, va(0x2000), data_page(1), RW, EnterFlags::MAY_FAIL);
        assert_eq!(result, Err(crate::PmapError::OutOfMemory));
        assert_eq!(a.resident_count(0), 0);
    }

    #[test]
    #[should_panic(expected = "pmap enter failed")]
    fn exhaustion_is_fatal_without_may_fail() {
        let m = TestMachine::new(1, 63);
        let a = m.sys.create();
        m.frames.exhaust();
        m.enter(&a, 0x2000, data_page(1), RW);
    }
}

mod bootstrap {
    use super::*;
    use crate::{Bootstrap, DirectMap, EmulatedMmu, testing::MEMORY_SIZE};

    const MIB: usize = 1024 * 1024;
    const GIB: usize = 1024 * MIB;

    #[test]
    fn early_memory_is_bump_allocated() {
        EmulatedMmu::set_current_cpu(0);
        let mmu = Arc::new(EmulatedMmu::new(1, 63));
        let mut boot = Bootstrap::new(
            PmapConfig::default(),
            DirectMap::emulated(MEMORY_SIZE),
            mmu,
            PhysicalAddress::new(2 * MIB)..PhysicalAddress::new(MEMORY_SIZE),
        );
        assert_eq!(boot.template(), PhysicalAddress::new(2 * MIB));
        // Template, one level-2 table and eight level-3 tables for 16 MiB.
        let next = boot.remaining().start;
        assert_eq!(next, PhysicalAddress::new(2 * MIB + 10 * PAGE_SIZE));

        let early = boot.reserve_early_memory(PAGE_SIZE + 1);
        assert_eq!(early, next.to_k0seg());
        assert_eq!(boot.remaining().start, next + 2 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "bootstrap memory exhausted")]
    fn early_memory_runs_out() {
        EmulatedMmu::set_current_cpu(0);
        let mmu = Arc::new(EmulatedMmu::new(1, 63));
        let mut boot = Bootstrap::new(
            PmapConfig::default(),
            DirectMap::emulated(MEMORY_SIZE),
            mmu,
            PhysicalAddress::new(2 * MIB)..PhysicalAddress::new(MEMORY_SIZE),
        );
        boot.reserve_early_memory(2 * MIB);
    }

    #[test]
    fn kernel_range_starts_covered() {
        let m = TestMachine::new(1, 63);
        assert_eq!(m.sys.kernel_end(), va(VM_MIN_KERNEL_ADDRESS + 16 * MIB));
        assert_eq!(
            m.sys.virtual_space(),
            (
                va(VM_MIN_KERNEL_ADDRESS),
                va(crate::arch::VM_MAX_KERNEL_ADDRESS)
            )
        );
        assert_eq!(m.mmu.context(0), Some((m.sys.template(), 0)));
    }

    #[test]
    fn grow_within_level1_slot() {
        let m = TestMachine::new(1, 63);
        let end = m.sys.grow_kernel_range(va(VM_MIN_KERNEL_ADDRESS + 19 * MIB));
        assert_eq!(end, va(VM_MIN_KERNEL_ADDRESS + 20 * MIB));
        assert_eq!(m.sys.grow_kernel_range(va(VM_MIN_KERNEL_ADDRESS)), end);

        let kva = VM_MIN_KERNEL_ADDRESS + 18 * MIB;
        m.sys
            .enter(m.sys.kernel_pmap(), va(kva), data_page(0), RW, EnterFlags::WIRED)
            .expect("enter failed");
        assert_eq!(m.sys.extract(m.sys.kernel_pmap(), va(kva)), Some(data_page(0)));
    }

    #[test]
    fn grow_propagates_new_level1_slots() {
        let config = PmapConfig {
            kernel_virtual_size: GIB - 8 * MIB,
            ..PmapConfig::default()
        };
        let m = TestMachine::with_config(1, 63, config);
        let early = m.sys.create();
        m.enter(&early, 0x2000, data_page(0), RW);

        let end = m.sys.grow_kernel_range(va(VM_MIN_KERNEL_ADDRESS + GIB + 1));
        assert_eq!(end, va(VM_MIN_KERNEL_ADDRESS + GIB + 2 * MIB));

        let slot = crate::arch::KERNEL_L1_FIRST + 1;
        let template = m.sys.memory().table(m.sys.template()).entry(slot);
        assert!(template.is_valid());
        let Level1::Private(level1) = early.level1(0) else {
            panic!("expected a private level-1 table");
        };
        assert_eq!(m.sys.memory().table(level1).entry(slot), template);

        let late = m.sys.create();
        m.enter(&late, 0x2000, data_page(1), RW);
        let Level1::Private(level1) = late.level1(0) else {
            panic!("expected a private level-1 table");
        };
        assert_eq!(m.sys.memory().table(level1).entry(slot), template);

        let kva = va(VM_MIN_KERNEL_ADDRESS + GIB);
        m.sys
            .enter(m.sys.kernel_pmap(), kva, data_page(2), RW, EnterFlags::WIRED)
            .expect("enter failed");
        assert_eq!(m.sys.extract(&late, kva), Some(data_page(2)));
    }
}

mod stress {
    use super::*;

    #[test]
    fn concurrent_mapping_and_page_operations() {
        const CPUS: usize = 4;
        let m = TestMachine::new(CPUS, 63);
        let pmaps: Vec<_> = (0..CPUS).map(|_| m.sys.create()).collect();

        std::thread::scope(|scope| {
            for (cpu, pmap) in pmaps.iter().enumerate() {
                let m = &m;
                scope.spawn(move || {
                    m.on_cpu(cpu);
                    m.sys.activate(pmap, cpu);
                    for round in 0..200 {
                        let address = 0x2000 + (round % 8) * PAGE_SIZE;
                        m.enter(pmap, address, data_page(round % 4), RW);
                        if round % 3 == 0 {
                            m.sys.remove_range(pmap, va(address), va(address + PAGE_SIZE), false);
                        }
                        if cpu == CPUS - 1 {
                            let page = data_page(round % 4);
                            if round % 10 == 0 {
                                m.sys.page_protect(page, VmProt::NONE);
                            } else {
                                m.sys.page_protect(page, VmProt::READ);
                                m.sys.clear_referenced(page);
                            }
                        }
                        #[cfg(feature = "multiprocessor")]
                        m.sys.process_shootdown();
                    }
                    m.remove_all(pmap);
                    m.sys.deactivate(pmap, cpu);
                });
            }
        });

        for pmap in &pmaps {
            let stats = pmap.stats(0);
            assert_eq!(stats.resident, 0);
            assert_eq!((stats.level2_tables, stats.level3_tables), (0, 0));
            assert_eq!(pmap.level1(0), Level1::SharedTemplate);
            m.sys.destroy(pmap);
        }
        for page in 0..4 {
            assert!(m.sys.pv_mappings(data_page(page)).is_empty());
        }
        assert_eq!(m.sys.pv_pool_stats().in_use, 0);
        m.assert_pv_consistent();
    }
}
