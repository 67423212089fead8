#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Physical Map (pmap)
//!
//! The machine-dependent half of the Polaris virtual memory system for a three-level,
//! ASN-tagged MMU with software reference/modify bits. It provides:
//!
//! - Address spaces that borrow the kernel's level-1 table until their first user mapping.
//! - Page tables that are allocated on demand and freed when their last entry goes.
//! - Reverse mappings from physical pages to every virtual mapping of them.
//! - Per-processor ASN allocation and multiprocessor TLB shootdown.
//! - Software emulation of the machine for testing in non-kernel environments.
//!
//! [`Bootstrap`] builds the kernel address space and produces the [`PmapSystem`] through
//! which everything else is done.

extern crate alloc;

mod address;
mod arch;
mod asn;
mod bootstrap;
mod config;
mod direct_map;
mod emulate;
mod error;
mod lock;
mod mapping;
mod numbers;
mod page_meta;
mod page_table;
mod platform;
mod pmap;
mod protection;
mod pv;
mod system;
mod tlb;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use address::{PhysicalAddress, VirtualAddress};
pub use bootstrap::Bootstrap;
pub use config::PmapConfig;
pub use direct_map::DirectMap;
pub use emulate::FaultKind;
pub use error::PmapError;
pub use mapping::EnterFlags;
pub use numbers::{FrameNumber, PageNumber};
pub use page_meta::{PageAttributes, PageMeta, PageMetaTable, PageUsage};
pub use platform::{AtomicCpuMask, CpuId, CpuMask, FrameAllocator, Ipi, MAX_CPUS, Mmu};
pub use pmap::{Level1, Pmap, PmapStats};
pub use protection::{VmProt, protection_bits};
pub use pv::{PvList, PvPoolStats};
pub use system::{PmapSystem, StealStats};

#[cfg(feature = "multiprocessor")]
pub use tlb::ShootdownQueues;

pub use arch::{PAGE_SIZE, PageEntry, PageFlags};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedFrameAllocator, EmulatedMemory, EmulatedMmu, TlbCounters};
