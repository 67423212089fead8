//! Recoverable failures of the physical map.

/// Errors surfaced to callers that opted into fallible operations.
///
/// Everything else the layer can detect is a broken invariant and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmapError {
    /// No page table page or reverse-mapping entry could be found, even after
    /// trying to reclaim one from another address space.
    #[error("out of memory")]
    OutOfMemory,
}
