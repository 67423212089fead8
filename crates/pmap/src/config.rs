//! Tunables fixed at bootstrap.

/// Configuration of the physical map.
///
/// The processor count is not configured here; it is whatever the [`Mmu`](crate::Mmu)
/// reports.
#[derive(Debug, Clone)]
pub struct PmapConfig {
    /// Reverse-mapping entries carved out of each pool page.
    pub pv_entries_per_page: usize,
    /// Upper bound on pages the reverse-mapping pool may take from the frame allocator.
    pub pv_pool_max_pages: usize,
    /// Shootdown jobs a processor may have pending before it falls back to a full flush.
    pub shootdown_queue_len: usize,
    /// Bytes of translated kernel space covered by tables at bootstrap.
    pub kernel_virtual_size: usize,
    /// Donor candidates a single steal may visit before it is reported as slow.
    pub donor_scan_warn: usize,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            pv_entries_per_page: 128,
            pv_pool_max_pages: 1024,
            shootdown_queue_len: 6,
            kernel_virtual_size: 16 * 1024 * 1024,
            donor_scan_warn: 4096,
        }
    }
}
