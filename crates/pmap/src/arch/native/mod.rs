//! Native MMU geometry.
//!
//! The target is a three-level, ASN-tagged MMU whose reference and modify bits are
//! maintained in software:
//! - 4 KiB pages, 512 eight-byte entries per table (9 index bits per level)
//! - 39-bit virtual addresses, sign-extended from bit 38
//! - Level 1 is the root, level 3 holds the leaf mappings
//!
//! Virtual layout:
//! - `[0, VM_MAX_USER_ADDRESS)`: user space (level-1 slots 0..255)
//! - `[K0SEG_BASE, K0SEG_END)`: untranslated direct map of physical memory
//! - `[VM_MIN_KERNEL_ADDRESS, VPT_BASE)`: translated kernel range
//! - `[VPT_BASE, ..)`: the virtual page table, the level-1 table mapped onto itself

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

/// Maximum number of bits in a physical address (32 bits of frame number).
pub const MAX_PHYSICAL_BITS: usize = 44;

/// Number of significant bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 39;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of page table levels.
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Index bits consumed by each level.
pub const INDEX_BITS: usize = 9;

/// Entries in one page table page.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;

/// Bytes of virtual space mapped by one level-3 table (one level-2 entry).
pub const L2_SEGMENT_SIZE: usize = PAGE_SIZE * ENTRIES_PER_TABLE;

/// Bytes of virtual space mapped by one level-2 table (one level-1 entry).
pub const L1_SEGMENT_SIZE: usize = L2_SEGMENT_SIZE * ENTRIES_PER_TABLE;

/// First address above user space. The last user level-1 slot is left unused.
pub const VM_MAX_USER_ADDRESS: usize = 0x0000_003F_C000_0000;

/// Base of the direct-mapped segment.
pub const K0SEG_BASE: usize = 0xFFFF_FFC0_0000_0000;

/// End of the direct-mapped segment.
pub const K0SEG_END: usize = 0xFFFF_FFE0_0000_0000;

/// Lowest translated kernel address.
pub const VM_MIN_KERNEL_ADDRESS: usize = 0xFFFF_FFE0_0000_0000;

/// Base of the virtual page table.
pub const VPT_BASE: usize = 0xFFFF_FFFF_C000_0000;

/// First address above the translated kernel range.
pub const VM_MAX_KERNEL_ADDRESS: usize = VPT_BASE;

/// Level-1 slot holding the self-reference.
pub const VPT_INDEX: usize = level1_index(VPT_BASE);

/// First level-1 slot owned by the kernel. Private level-1 tables copy every slot from here up.
pub const KERNEL_L1_FIRST: usize = level1_index(VM_MIN_KERNEL_ADDRESS);

/// Number of level-1 slots usable by user space.
pub const USER_L1_SLOTS: usize = level1_index(VM_MAX_USER_ADDRESS);

/// Returns the page table index for a virtual address at the given level.
///
/// Level 1 is the root table and level 3 the leaf table.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    let shift = match level {
        1 | 2 | 3 => PAGE_SHIFT + (PAGE_TABLE_LEVELS - level) * INDEX_BITS,
        _ => panic!("level out of range (1-3)"),
    };
    (address >> shift) & (ENTRIES_PER_TABLE - 1)
}

#[inline]
pub const fn level1_index(address: usize) -> usize {
    page_index(address, 1)
}

#[inline]
pub const fn level2_index(address: usize) -> usize {
    page_index(address, 2)
}

#[inline]
pub const fn level3_index(address: usize) -> usize {
    page_index(address, 3)
}

/// Validates a physical address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address.
///
/// Virtual addresses must be canonical (bits 39-63 must be sign-extended from bit 38).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Sign-extends bit 38 into bits 39-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    let high_mask = !((1usize << MAX_VIRTUAL_BITS) - 1);
    if (addr & (1 << (MAX_VIRTUAL_BITS - 1))) != 0 {
        addr | high_mask
    } else {
        addr & !high_mask
    }
}

/// Returns the address, inside the virtual page table, of the leaf entry that maps `va`.
///
/// The page containing that address is the level-3 table itself as seen through the
/// self-reference, which is why freeing a level-3 table must invalidate it.
#[inline]
pub const fn vpt_entry_address(va: usize) -> usize {
    let vpn_mask = (1usize << (MAX_VIRTUAL_BITS - PAGE_SHIFT)) - 1;
    VPT_BASE + ((va >> PAGE_SHIFT) & vpn_mask) * core::mem::size_of::<u64>()
}

/// Returns true if `va` lies in the direct-mapped segment.
#[inline]
pub const fn is_k0seg(va: usize) -> bool {
    va >= K0SEG_BASE && va < K0SEG_END
}
