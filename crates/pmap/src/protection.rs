//! Translation of machine-independent protections into entry bits.

use bitflags::bitflags;

use crate::arch::PageFlags;

bitflags! {
    /// Access rights requested by the virtual memory system.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl VmProt {
    pub const NONE: Self = Self::empty();
    pub const ALL: Self = Self::all();
}

/// Returns the protection bits of a leaf entry.
///
/// Kernel mappings are always address-space-match. Execute permission adds the software
/// `EXECUTE` bit; without it the entry faults on execute so the fault handler can refuse.
pub fn protection_bits(kernel: bool, prot: VmProt) -> PageFlags {
    let read = prot.intersects(VmProt::READ | VmProt::EXECUTE);
    let write = prot.contains(VmProt::WRITE);

    let mut bits = match (kernel, read, write) {
        (true, false, false) => PageFlags::ADDRESS_SPACE_MATCH,
        (true, true, false) => PageFlags::ADDRESS_SPACE_MATCH | PageFlags::KERNEL_READ,
        (true, false, true) => PageFlags::ADDRESS_SPACE_MATCH | PageFlags::KERNEL_WRITE,
        (true, true, true) => {
            PageFlags::ADDRESS_SPACE_MATCH | PageFlags::KERNEL_WRITE | PageFlags::KERNEL_READ
        }
        (false, false, false) => PageFlags::empty(),
        (false, true, false) => PageFlags::USER_READ | PageFlags::KERNEL_READ,
        (false, false, true) => PageFlags::USER_WRITE | PageFlags::KERNEL_WRITE,
        (false, true, true) => {
            PageFlags::USER_WRITE
                | PageFlags::USER_READ
                | PageFlags::KERNEL_WRITE
                | PageFlags::KERNEL_READ
        }
    };
    if prot.contains(VmProt::EXECUTE) {
        bits |= PageFlags::EXECUTE;
    } else {
        bits |= PageFlags::FAULT_ON_EXECUTE;
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    mod kernel {
        use super::*;

        #[test]
        fn none_is_global_only() {
            assert_eq!(
                protection_bits(true, VmProt::NONE),
                PageFlags::ADDRESS_SPACE_MATCH | PageFlags::FAULT_ON_EXECUTE
            );
        }

        #[test]
        fn execute_reads() {
            let bits = protection_bits(true, VmProt::EXECUTE);
            assert!(bits.contains(PageFlags::KERNEL_READ | PageFlags::EXECUTE));
            assert!(!bits.intersects(PageFlags::USER_READ | PageFlags::WRITE_ENABLE));
            assert!(!bits.contains(PageFlags::FAULT_ON_EXECUTE));
        }

        #[test]
        fn write_alone_does_not_read() {
            let bits = protection_bits(true, VmProt::WRITE);
            assert_eq!(
                bits,
                PageFlags::ADDRESS_SPACE_MATCH
                    | PageFlags::KERNEL_WRITE
                    | PageFlags::FAULT_ON_EXECUTE
            );
        }
    }

    mod user {
        use super::*;

        #[test]
        fn none_only_faults() {
            assert_eq!(
                protection_bits(false, VmProt::NONE),
                PageFlags::FAULT_ON_EXECUTE
            );
        }

        #[test]
        fn read_write() {
            let bits = protection_bits(false, VmProt::READ | VmProt::WRITE);
            assert!(bits.contains(PageFlags::USER_READ | PageFlags::USER_WRITE));
            assert!(bits.contains(PageFlags::KERNEL_READ | PageFlags::KERNEL_WRITE));
            assert!(!bits.is_global());
            assert!(!bits.contains(PageFlags::EXECUTE));
            assert!(bits.contains(PageFlags::FAULT_ON_EXECUTE));
        }

        #[test]
        fn all_grants_execute() {
            let bits = protection_bits(false, VmProt::ALL);
            assert!(bits.contains(PageFlags::EXECUTE | PageFlags::USER_WRITE));
        }
    }
}
