//! Multiprocessor shootdown queues.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use crate::{
    CpuId, Mmu, PhysicalAddress, VirtualAddress,
    arch::PageEntry,
    asn::AsnAllocator,
    pmap::{Level1, Pmap},
};

/// Work queued for a remote processor.
pub(crate) enum ShootdownJob {
    /// Drop any cached copy of `pte` at `va` in `pmap`.
    Invalidate {
        pmap: Arc<Pmap>,
        va: VirtualAddress,
        pte: PageEntry,
    },
    /// Reload the context of `pmap` if it is active, because its level-1 table changed.
    Reload { pmap: Arc<Pmap> },
}

#[derive(Default)]
struct JobQueue {
    invalidations: Vec<(Arc<Pmap>, VirtualAddress, PageEntry)>,
    reloads: Vec<Arc<Pmap>>,
    /// Set once the queue overflowed; `Some(true)` if a dropped job was global.
    flush_all: Option<bool>,
}

/// One bounded job queue per processor.
///
/// Invalidations beyond the capacity are not queued; the processor flushes its whole TLB
/// instead, which covers them. Reloads are always kept since a flush does not replace them.
pub struct ShootdownQueues {
    capacity: usize,
    queues: Box<[spin::Mutex<JobQueue>]>,
}

impl ShootdownQueues {
    pub fn new(cpu_count: usize, capacity: usize) -> Self {
        Self {
            capacity,
            queues: (0..cpu_count)
                .map(|_| spin::Mutex::new(JobQueue::default()))
                .collect(),
        }
    }

    pub(crate) fn push(&self, cpu: CpuId, job: ShootdownJob) {
        let mut guard = self.queues[cpu].lock();
        let queue = &mut *guard;
        match job {
            ShootdownJob::Reload { pmap } => {
                if !queue.reloads.iter().any(|queued| Arc::ptr_eq(queued, &pmap)) {
                    queue.reloads.push(pmap);
                }
            }
            ShootdownJob::Invalidate { pmap, va, pte } => {
                let global = pte.flags().is_global();
                if let Some(flush_global) = queue.flush_all.as_mut() {
                    *flush_global |= global;
                } else if queue.invalidations.len() >= self.capacity {
                    log::trace!("cpu {cpu}: shootdown queue overflow");
                    let any_global = global
                        || queue
                            .invalidations
                            .iter()
                            .any(|(_, _, pte)| pte.flags().is_global());
                    queue.invalidations.clear();
                    queue.flush_all = Some(any_global);
                } else {
                    queue.invalidations.push((pmap, va, pte));
                }
            }
        }
    }

    /// Number of invalidations queued for `cpu`.
    pub fn pending(&self, cpu: CpuId) -> usize {
        self.queues[cpu].lock().invalidations.len()
    }

    /// True if `cpu` will flush everything when it next drains its queue.
    pub fn overflowed(&self, cpu: CpuId) -> bool {
        self.queues[cpu].lock().flush_all.is_some()
    }

    /// Drains the queue of the executing processor and performs the work.
    pub(crate) fn process(
        &self,
        mmu: &dyn Mmu,
        asns: &AsnAllocator,
        template: PhysicalAddress,
    ) {
        let cpu = mmu.current_cpu();
        let queue = core::mem::take(&mut *self.queues[cpu].lock());

        for pmap in queue.reloads {
            if !pmap.is_active_on(cpu) {
                continue;
            }
            let inner = pmap.inner.lock(cpu);
            let level1 = match inner.level1 {
                Level1::SharedTemplate => template,
                Level1::Private(level1) => level1,
            };
            let asn = asns.assign(mmu, &pmap, inner.level1, cpu);
            mmu.load_context(level1, asn);
            log::trace!("cpu {cpu}: reloaded pmap {} at {level1}", pmap.id());
        }

        match queue.flush_all {
            Some(true) => mmu.invalidate_all(),
            Some(false) => mmu.invalidate_user(),
            None => {
                for (pmap, va, pte) in queue.invalidations {
                    super::invalidate_local(mmu, cpu, &pmap, va, pte);
                }
            }
        }
    }
}
