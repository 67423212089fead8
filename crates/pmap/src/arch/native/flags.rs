//! Page table entry flag bits.

use bitflags::bitflags;

bitflags! {
    /// Flag bits held in the low half of a page table entry.
    ///
    /// Hardware bits occupy 0..15, software bits 16..31. Intermediate entries only ever
    /// use `VALID`, `ADDRESS_SPACE_MATCH` and the kernel read/write enables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// Entry is valid.
        const VALID = 1 << 0;
        /// Fault on read.
        const FAULT_ON_READ = 1 << 1;
        /// Fault on write.
        const FAULT_ON_WRITE = 1 << 2;
        /// Fault on execute.
        const FAULT_ON_EXECUTE = 1 << 3;
        /// Address space match: the translation ignores the ASN.
        const ADDRESS_SPACE_MATCH = 1 << 4;
        const KERNEL_READ = 1 << 8;
        const USER_READ = 1 << 9;
        const KERNEL_WRITE = 1 << 12;
        const USER_WRITE = 1 << 13;
        /// Software: mapping is pinned against removal.
        const WIRED = 1 << 16;
        /// Software: mapping has an entry on its page's PV list.
        const PV_LIST = 1 << 17;
        /// Software: mapping grants execute.
        const EXECUTE = 1 << 18;
    }
}

impl PageFlags {
    /// All three reference/modify emulation bits.
    pub const FAULT_BITS: Self = Self::FAULT_ON_READ
        .union(Self::FAULT_ON_WRITE)
        .union(Self::FAULT_ON_EXECUTE);

    /// Bits rewritten when the protection of a mapping changes.
    pub const PROTECTION: Self = Self::ADDRESS_SPACE_MATCH
        .union(Self::KERNEL_READ)
        .union(Self::USER_READ)
        .union(Self::KERNEL_WRITE)
        .union(Self::USER_WRITE)
        .union(Self::EXECUTE);

    /// Bits the hardware never looks at. Changing only these needs no TLB work.
    pub const SOFTWARE: Self = Self::WIRED.union(Self::PV_LIST).union(Self::EXECUTE);

    /// Both write enables.
    pub const WRITE_ENABLE: Self = Self::KERNEL_WRITE.union(Self::USER_WRITE);

    /// Flags of an entry that links to a kernel-owned table.
    pub const KERNEL_TABLE: Self = Self::VALID
        .union(Self::ADDRESS_SPACE_MATCH)
        .union(Self::KERNEL_READ)
        .union(Self::KERNEL_WRITE);

    /// Flags of an entry that links to a table private to one address space.
    pub const USER_TABLE: Self = Self::VALID
        .union(Self::KERNEL_READ)
        .union(Self::KERNEL_WRITE);

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.contains(Self::VALID)
    }

    #[inline]
    pub const fn is_global(self) -> bool {
        self.contains(Self::ADDRESS_SPACE_MATCH)
    }

    #[inline]
    pub const fn is_wired(self) -> bool {
        self.contains(Self::WIRED)
    }
}
