//! Linux futex-based parking
//!
//! Futex word semantics: the word is a wake epoch. Every wake increments it.
//!
//! When a thread parks:
//! 1. Increment parked count
//! 2. Read the epoch, then evaluate the caller's condition
//! 3. FUTEX_WAIT on the epoch read in step 2 (returns at once if it moved)
//! 4. Decrement parked count on return
//!
//! When waking:
//! 1. Increment the epoch
//! 2. If anyone is parked, FUTEX_WAKE 1 or all waiters

use super::Parking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub struct FutexParking {
    /// Futex word: wake epoch
    epoch: AtomicU32,

    /// Count of parked threads (lets wakers skip the syscall)
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn futex_wake(&self, count: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.epoch.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn bump_and_wake(&self, count: i32) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) == 0 {
            return;
        }
        self.futex_wake(count);
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for FutexParking {
    fn park_unless(&self, ready: &dyn Fn() -> bool, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);

        if ready() {
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        // Durations past time_t wait without a timeout.
        let timespec = timeout.and_then(|d| {
            Some(libc::timespec {
                tv_sec: libc::time_t::try_from(d.as_secs()).ok()?,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            })
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };

        // FUTEX_WAIT: sleep while the epoch still equals what we read
        let result = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.epoch.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                epoch,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            )
        };

        self.parked.fetch_sub(1, Ordering::SeqCst);

        if result == 0 {
            return true;
        }
        // EAGAIN: the epoch moved before we slept, which is a wake.
        let errno = unsafe { *libc::__errno_location() };
        errno == libc::EAGAIN
    }

    fn wake_one(&self) {
        self.bump_and_wake(1);
    }

    fn wake_all(&self) {
        self.bump_and_wake(i32::MAX);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
