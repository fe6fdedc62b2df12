//! Spin-then-yield mutual exclusion for short critical sections.
//!
//! The large-object path and partition initialization hold this lock for a
//! handful of instructions plus at most one syscall, so a full OS mutex is
//! overkill. Contended acquirers busy-wait with exponential backoff up to a
//! cap, then yield the processor and start over.

use crate::memory::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicU32, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::{hint, thread, unsafe_cell_get, unsafe_cell_get_mut};
use std::ops::{Deref, DerefMut};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Upper bound on the busy-wait burst before yielding.
const MAX_SPIN_LIMIT: u32 = 1024;

pub(crate) struct SpinLock<T> {
    word: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: the lock word serializes all access to `data`.
unsafe impl<T: Send> Send for SpinLock<T> {}
// Safety: same; &SpinLock only hands out data through the guard.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[cfg(not(loom))]
    pub(crate) const fn new(value: T) -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new(value: T) -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
        if self.word.swap(LOCKED, Ordering::Acquire) != UNLOCKED {
            self.contended_lock();
        }
        SpinGuard { lock: self }
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.word.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    #[cold]
    fn contended_lock(&self) {
        // On a uniprocessor the holder cannot make progress while we spin,
        // so skip straight to yielding.
        let spin_cap = if PlatformVmOps::num_processors() > 1 {
            MAX_SPIN_LIMIT
        } else {
            0
        };
        let mut limit: u32 = 1;
        loop {
            if self.word.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            if limit < spin_cap {
                for _ in 0..limit {
                    hint::spin_loop();
                }
                limit *= 2;
            } else {
                thread::yield_now();
                limit = 1;
            }
        }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock, so no mutable alias exists.
        unsafe_cell_get!(self.lock.data)
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe_cell_get_mut!(self.lock.data)
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.word.store(UNLOCKED, Ordering::Release);
    }
}

/// Pad-and-align wrapper that gives a value its own cache line, keeping
/// hot shared state (the lock word) off lines written by other data.
#[repr(align(64))]
pub(crate) struct CachePadded<T>(pub(crate) T);
