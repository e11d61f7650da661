//! Lock-free shutdown refcount.
//!
//! The counter starts at 1, which stands for the owner's own hold on the
//! resource. Every piece of in-flight work joins with
//! `increment_if_nonzero()` and leaves with `decrement()`. Once the count
//! reaches zero it stays there: the join fails and the caller must treat the
//! resource as shutting down.

use crate::sync::{spin_loop, AtomicUsize, Ordering};

/// Atomic counter with an "increment only if nonzero" join operation.
#[derive(Debug)]
pub struct AtomicRefcount {
    count: AtomicUsize,
}

impl AtomicRefcount {
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    /// Add one and return the new value.
    #[inline]
    pub fn increment(&self) -> usize {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Subtract one and return the new value.
    ///
    /// # Panics
    ///
    /// If the counter is already zero. Going below zero means some holder
    /// released twice, which is a bug in the caller.
    pub fn decrement(&self) -> usize {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            assert!(current != 0, "AtomicRefcount decremented below zero");
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(observed) => {
                    current = observed;
                    spin_loop();
                }
            }
        }
    }

    /// Add one unless the counter is zero.
    ///
    /// Returns `false` without touching the counter when it reads zero.
    /// Retries on contention until it either succeeds or observes zero.
    pub fn increment_if_nonzero(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => {
                    current = observed;
                    spin_loop();
                }
            }
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
