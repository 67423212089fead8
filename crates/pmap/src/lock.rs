//! Address space lock.

use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::CpuId;

const UNLOCKED: usize = 0;

/// A spin lock that remembers which processor holds it.
///
/// Operations that walk a page's reverse mappings lock address spaces in the opposite
/// order from everything else. They must skip an address space whose lock the current
/// processor already holds instead of spinning on it forever, which needs the owner.
pub struct PmapLock<T> {
    /// `UNLOCKED`, or the owning processor plus one.
    owner: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for PmapLock<T> {}
unsafe impl<T: Send> Send for PmapLock<T> {}

impl<T> PmapLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            owner: AtomicUsize::new(UNLOCKED),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self, cpu: CpuId) -> Option<PmapGuard<'_, T>> {
        self.owner
            .compare_exchange(UNLOCKED, cpu + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PmapGuard { lock: self })
    }

    /// Spin until acquired.
    ///
    /// # Panics
    /// Panics if `cpu` already holds the lock.
    pub fn lock(&self, cpu: CpuId) -> PmapGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock(cpu) {
                return guard;
            }
            assert!(!self.held_by(cpu), "recursive address space lock");
            while self.owner.load(Ordering::Relaxed) != UNLOCKED {
                spin_loop();
            }
        }
    }

    /// Spin until acquired, unless `cpu` already holds the lock, in which case return
    /// `None` instead of deadlocking.
    pub fn lock_unless_held(&self, cpu: CpuId) -> Option<PmapGuard<'_, T>> {
        loop {
            if let Some(guard) = self.try_lock(cpu) {
                return Some(guard);
            }
            if self.held_by(cpu) {
                return None;
            }
            spin_loop();
        }
    }

    /// True if `cpu` currently holds the lock.
    #[inline]
    pub fn held_by(&self, cpu: CpuId) -> bool {
        self.owner.load(Ordering::Relaxed) == cpu + 1
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }
}

pub struct PmapGuard<'a, T> {
    lock: &'a PmapLock<T>,
}

impl<T> Deref for PmapGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for PmapGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for PmapGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(UNLOCKED, Ordering::Release);
    }
}
