//! Emulated frame allocator.

use core::ops::Range;

use alloc::vec::Vec;

use crate::{FrameAllocator, PageUsage, PhysicalAddress, arch::PAGE_SIZE};

struct FrameState {
    /// Free frames, lowest address last so it is handed out first.
    free: Vec<PhysicalAddress>,
    outstanding: usize,
    limit: Option<usize>,
}

/// A frame allocator over a fixed physical range.
///
/// A limit on outstanding allocations lets tests run the system out of memory at a
/// precise point without shrinking the range itself.
pub struct EmulatedFrameAllocator {
    state: spin::Mutex<FrameState>,
}

impl EmulatedFrameAllocator {
    /// Creates an allocator owning every page in `range`.
    pub fn new(range: Range<PhysicalAddress>) -> Self {
        let start = range.start.align_up(PAGE_SIZE).as_usize();
        let end = range.end.align_down(PAGE_SIZE).as_usize();
        let free = (start..end)
            .step_by(PAGE_SIZE)
            .rev()
            .map(PhysicalAddress::new)
            .collect();
        Self {
            state: spin::Mutex::new(FrameState {
                free,
                outstanding: 0,
                limit: None,
            }),
        }
    }

    /// Caps the number of pages that may be outstanding at once.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.state.lock().limit = limit;
    }

    /// Only allows the pages already handed out; every further allocation fails.
    pub fn exhaust(&self) {
        let mut state = self.state.lock();
        state.limit = Some(state.outstanding);
    }

    /// Pages currently handed out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Pages still available, ignoring the limit.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }
}

impl FrameAllocator for EmulatedFrameAllocator {
    fn alloc_page(&self, usage: PageUsage) -> Option<PhysicalAddress> {
        let mut state = self.state.lock();
        if state.limit.is_some_and(|limit| state.outstanding >= limit) {
            log::trace!("emulated frame allocator: limit reached allocating {:?}", usage);
            return None;
        }
        let page = state.free.pop()?;
        state.outstanding += 1;
        Some(page)
    }

    fn free_page(&self, page: PhysicalAddress) {
        let mut state = self.state.lock();
        debug_assert!(!state.free.contains(&page), "double free of {page}");
        state.outstanding -= 1;
        state.free.push(page);
    }
}
