//! Per-page metadata for managed physical memory.
//!
//! Every page in the managed range has a [`PageMeta`] recording what the page is used for,
//! a reference count when the page holds a page table, the emulated reference/modify
//! attributes, and the page's reverse-mapping list.

use core::ops::Range;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use alloc::boxed::Box;
use bitflags::bitflags;

use crate::{FrameNumber, PhysicalAddress, arch::PAGE_SIZE, pv::PvList};

/// What a physical page is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageUsage {
    /// Free, or owned by someone that never told us.
    Unused = 0,
    /// Ordinary data page.
    Normal = 1,
    /// Level-1 (root) page table.
    Level1 = 2,
    /// Level-2 page table.
    Level2 = 3,
    /// Level-3 (leaf) page table.
    Level3 = 4,
    /// Backing page of the reverse-mapping entry pool.
    PvPool = 5,
}

impl PageUsage {
    /// True for the three page table kinds.
    pub const fn is_table(self) -> bool {
        matches!(self, Self::Level1 | Self::Level2 | Self::Level3)
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unused,
            1 => Self::Normal,
            2 => Self::Level1,
            3 => Self::Level2,
            4 => Self::Level3,
            5 => Self::PvPool,
            _ => panic!("corrupt page usage"),
        }
    }
}

bitflags! {
    /// Emulated hardware attributes of a physical page, shared by all of its mappings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageAttributes: u8 {
        const REFERENCED = 1 << 0;
        const MODIFIED = 1 << 1;
    }
}

/// Holds metadata for one managed physical page.
pub struct PageMeta {
    usage: AtomicU8,
    /// Valid entries in the table held by this page. Only meaningful for table pages.
    refcount: AtomicUsize,
    attributes: AtomicU8,
    /// Reverse mappings of this page.
    pub(crate) pv: spin::Mutex<PvList>,
}

impl PageMeta {
    fn new() -> Self {
        Self {
            usage: AtomicU8::new(PageUsage::Unused as u8),
            refcount: AtomicUsize::new(0),
            attributes: AtomicU8::new(0),
            pv: spin::Mutex::new(PvList::new()),
        }
    }

    pub fn usage(&self) -> PageUsage {
        PageUsage::from_u8(self.usage.load(Ordering::Acquire))
    }

    pub fn set_usage(&self, usage: PageUsage) {
        self.usage.store(usage as u8, Ordering::Release);
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increments the table reference count, returning the new count.
    ///
    /// # Panics
    /// Panics if the page does not hold a page table.
    pub fn add_ref(&self) -> usize {
        let usage = self.usage();
        assert!(usage.is_table(), "add_ref on a {usage:?} page");
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the table reference count, returning the new count.
    ///
    /// # Panics
    /// Panics if the page does not hold a page table or the count is already zero.
    pub fn del_ref(&self) -> usize {
        let usage = self.usage();
        assert!(usage.is_table(), "del_ref on a {usage:?} page");
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "table reference count underflow");
        previous - 1
    }

    pub fn attributes(&self) -> PageAttributes {
        PageAttributes::from_bits_truncate(self.attributes.load(Ordering::Acquire))
    }

    pub fn set_attributes(&self, attributes: PageAttributes) {
        self.attributes
            .fetch_or(attributes.bits(), Ordering::AcqRel);
    }

    /// Clears `attributes`, returning whether any of them were set.
    pub fn clear_attributes(&self, attributes: PageAttributes) -> bool {
        let previous = self
            .attributes
            .fetch_and(!attributes.bits(), Ordering::AcqRel);
        previous & attributes.bits() != 0
    }

    /// Resets the page for reuse by a new owner.
    fn reset(&self, usage: PageUsage) {
        self.refcount.store(0, Ordering::Release);
        self.set_usage(usage);
    }
}

/// Metadata for every page of the managed physical range.
pub struct PageMetaTable {
    first: FrameNumber,
    pages: Box<[PageMeta]>,
}

impl PageMetaTable {
    /// Creates metadata for every page in `range`.
    pub fn new(range: Range<PhysicalAddress>) -> Self {
        let first = range.start.align_up(PAGE_SIZE).frame_number();
        let end = range.end.align_down(PAGE_SIZE).frame_number();
        let count = if end > first { end - first } else { 0 };
        log::debug!(
            "page metadata: {} pages from {}",
            count,
            first.start()
        );
        Self {
            first,
            pages: (0..count).map(|_| PageMeta::new()).collect(),
        }
    }

    /// Returns the metadata of the page containing `pa`, if it is managed.
    pub fn get(&self, pa: PhysicalAddress) -> Option<&PageMeta> {
        let frame = pa.frame_number();
        if frame < self.first {
            return None;
        }
        self.pages.get(frame - self.first)
    }

    pub fn is_managed(&self, pa: PhysicalAddress) -> bool {
        self.get(pa).is_some()
    }

    /// Returns the metadata of a page the caller knows to be managed.
    ///
    /// # Panics
    /// Panics if `pa` is outside the managed range.
    pub fn page(&self, pa: PhysicalAddress) -> &PageMeta {
        match self.get(pa) {
            Some(meta) => meta,
            None => panic!("{pa} is not a managed page"),
        }
    }

    /// Iterates over every managed page with its address.
    pub fn iter(&self) -> impl Iterator<Item = (PhysicalAddress, &PageMeta)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .map(|(index, meta)| ((self.first + index).start(), meta))
    }

    /// Records a new owner for a page handed out by the frame allocator.
    ///
    /// Pages outside the managed range are ignored.
    pub fn set_usage(&self, pa: PhysicalAddress, usage: PageUsage) {
        if let Some(meta) = self.get(pa) {
            meta.reset(usage);
        }
    }

    /// Returns the usage of a page. Unmanaged pages are reported as `Unused`.
    pub fn classify(&self, pa: PhysicalAddress) -> PageUsage {
        self.get(pa).map_or(PageUsage::Unused, PageMeta::usage)
    }

    /// Increments the reference count of the table at `pa`.
    pub fn add_ref(&self, pa: PhysicalAddress) -> usize {
        self.page(pa).add_ref()
    }

    /// Decrements the reference count of the table at `pa`.
    pub fn del_ref(&self, pa: PhysicalAddress) -> usize {
        self.page(pa).del_ref()
    }

    pub fn refcount(&self, pa: PhysicalAddress) -> usize {
        self.page(pa).refcount()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }
}
