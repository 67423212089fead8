//! Bootstrap of the kernel address space.
//!
//! Before the frame allocator exists, pages come from a boot-time physical range by bump
//! allocation. [`Bootstrap`] builds the kernel template and enough kernel tables for the
//! initial kernel range out of it, lends out further early memory, and finally hands
//! everything to the [`PmapSystem`].

use core::ops::Range;

use alloc::{sync::Arc, vec::Vec};

use crate::{
    DirectMap, FrameAllocator, Mmu, PageMetaTable, PageUsage, PhysicalAddress, PmapConfig,
    PmapSystem, VirtualAddress,
    arch::{
        ENTRIES_PER_TABLE, KERNEL_L1_FIRST, L2_SEGMENT_SIZE, PAGE_SIZE, PageEntry, PageFlags,
        VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS, VPT_INDEX,
    },
    pmap::Level1,
    tlb::TlbBatch,
};

/// Kernel address space under construction.
pub struct Bootstrap {
    config: PmapConfig,
    memory: DirectMap,
    mmu: Arc<dyn Mmu>,
    next: PhysicalAddress,
    end: PhysicalAddress,
    template: PhysicalAddress,
    kernel_end: VirtualAddress,
    tables: Vec<(PhysicalAddress, PageUsage)>,
}

impl Bootstrap {
    /// Builds the kernel template and the kernel tables covering
    /// [`PmapConfig::kernel_virtual_size`] from pages of `avail`.
    ///
    /// # Panics
    /// Panics if `avail` cannot hold the tables.
    pub fn new(
        config: PmapConfig,
        memory: DirectMap,
        mmu: Arc<dyn Mmu>,
        avail: Range<PhysicalAddress>,
    ) -> Self {
        let size = config
            .kernel_virtual_size
            .next_multiple_of(L2_SEGMENT_SIZE)
            .clamp(L2_SEGMENT_SIZE, VM_MAX_KERNEL_ADDRESS - VM_MIN_KERNEL_ADDRESS);

        let mut boot = Self {
            config,
            memory,
            mmu,
            next: avail.start.align_up(PAGE_SIZE),
            end: avail.end.align_down(PAGE_SIZE),
            template: PhysicalAddress::new(0),
            kernel_end: VirtualAddress::new(VM_MIN_KERNEL_ADDRESS + size),
            tables: Vec::new(),
        };

        let template = boot.steal_page();
        boot.tables.push((template, PageUsage::Level1));
        boot.template = template;
        boot.memory
            .table(template)
            .set_entry(VPT_INDEX, PageEntry::new(template, PageFlags::USER_TABLE));

        let level3_count = size / L2_SEGMENT_SIZE;
        for index in 0..level3_count {
            let l1_index = KERNEL_L1_FIRST + index / ENTRIES_PER_TABLE;
            if index % ENTRIES_PER_TABLE == 0 {
                let page = boot.steal_page();
                boot.tables.push((page, PageUsage::Level2));
                boot.memory
                    .table(template)
                    .set_entry(l1_index, PageEntry::new(page, PageFlags::KERNEL_TABLE));
            }
            let level2 = boot.memory.table(template).entry(l1_index).address();
            let page = boot.steal_page();
            boot.tables.push((page, PageUsage::Level3));
            boot.memory.table(level2).set_entry(
                index % ENTRIES_PER_TABLE,
                PageEntry::new(page, PageFlags::KERNEL_TABLE),
            );
        }

        log::debug!(
            "bootstrap: template at {template}, kernel tables cover {}..{}, {} table pages",
            VirtualAddress::new(VM_MIN_KERNEL_ADDRESS),
            boot.kernel_end,
            boot.tables.len()
        );
        boot
    }

    fn steal_page(&mut self) -> PhysicalAddress {
        if self.next >= self.end {
            panic!("bootstrap memory exhausted");
        }
        let page = self.next;
        self.next = self.next + PAGE_SIZE;
        self.memory.zero_page(page);
        page
    }

    /// Takes `size` bytes of zeroed early memory and returns their direct-mapped address.
    ///
    /// # Panics
    /// Panics if the boot-time range is exhausted.
    pub fn reserve_early_memory(&mut self, size: usize) -> VirtualAddress {
        let pages = size.div_ceil(PAGE_SIZE).max(1);
        let start = self.next;
        if self.end - start < pages * PAGE_SIZE {
            panic!("bootstrap memory exhausted reserving {size} bytes");
        }
        for _ in 0..pages {
            self.steal_page();
        }
        log::debug!("bootstrap: reserved {pages} pages at {start}");
        self.memory.phys_to_virt(start)
    }

    /// Boot-time physical memory not taken yet.
    pub fn remaining(&self) -> Range<PhysicalAddress> {
        self.next..self.end
    }

    /// The kernel template level-1 table.
    pub fn template(&self) -> PhysicalAddress {
        self.template
    }

    /// Completes bootstrap: installs the frame allocator and metadata for the `managed`
    /// physical range, and activates the kernel address space on the current processor.
    pub fn finish(self, frames: Arc<dyn FrameAllocator>, managed: Range<PhysicalAddress>) -> PmapSystem {
        let pages = PageMetaTable::new(managed);
        for &(page, usage) in &self.tables {
            pages.set_usage(page, usage);
        }

        let system = PmapSystem::new(
            self.config,
            self.memory,
            self.mmu,
            frames,
            pages,
            self.template,
            self.kernel_end,
        );
        let cpu = system.current_cpu();
        system.activate(system.kernel_pmap(), cpu);
        log::debug!("bootstrap: finished on cpu {cpu}");
        system
    }
}

impl PmapSystem {
    /// Makes kernel tables cover kernel space up to at least `new_end` and returns the new
    /// end of the covered range.
    ///
    /// New level-1 slots are copied into every private level-1 table.
    ///
    /// # Panics
    /// Panics if no page can be found for a new table.
    pub fn grow_kernel_range(&self, new_end: VirtualAddress) -> VirtualAddress {
        let _direction = self.pv_direction.read();
        let mut range = self.kernel_range.lock();

        let target = new_end
            .as_usize()
            .min(VM_MAX_KERNEL_ADDRESS)
            .next_multiple_of(L2_SEGMENT_SIZE);
        let target = VirtualAddress::new(target);
        if target <= range.end {
            return range.end;
        }

        let mut tlb = self.tlb();
        let template = self.memory.table(self.template);
        let mut grew_level1 = false;
        let mut va = range.end;
        while va < target {
            let l1_index = va.page_index(1);
            let l1_entry = template.entry(l1_index);
            let level2 = if l1_entry.is_valid() {
                l1_entry.address()
            } else {
                let page = self.grow_table(PageUsage::Level2, &mut tlb);
                template.set_entry(l1_index, PageEntry::new(page, PageFlags::KERNEL_TABLE));
                grew_level1 = true;
                page
            };
            let level3 = self.grow_table(PageUsage::Level3, &mut tlb);
            self.memory
                .table(level2)
                .set_entry(va.page_index(2), PageEntry::new(level3, PageFlags::KERNEL_TABLE));
            va = va + L2_SEGMENT_SIZE;
        }
        range.end = target;

        if grew_level1 {
            let cpu = tlb.cpu();
            for pmap in self.pmaps() {
                if pmap.is_kernel() {
                    continue;
                }
                let inner = pmap.inner.lock(cpu);
                if let Level1::Private(level1) = inner.level1 {
                    self.memory
                        .table(level1)
                        .copy_from(template, KERNEL_L1_FIRST..VPT_INDEX);
                }
            }
        }
        log::debug!("kernel range grown to {target}");
        target
    }

    fn grow_table(&self, usage: PageUsage, tlb: &mut TlbBatch<'_>) -> PhysicalAddress {
        match self.alloc_table_page(&self.kernel, usage, tlb) {
            Ok(page) => page,
            Err(error) => {
                log::error!("grow_kernel_range: no page for a {usage:?} table");
                panic!("grow_kernel_range: {error}");
            }
        }
    }

    /// Kernel virtual space handed to the VM system.
    pub fn virtual_space(&self) -> (VirtualAddress, VirtualAddress) {
        (
            VirtualAddress::new(VM_MIN_KERNEL_ADDRESS),
            VirtualAddress::new(VM_MAX_KERNEL_ADDRESS),
        )
    }

    /// End of the kernel range currently backed by tables.
    pub fn kernel_end(&self) -> VirtualAddress {
        self.kernel_range.lock().end
    }
}
