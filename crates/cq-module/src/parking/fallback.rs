//! Condvar-based parking
//!
//! Used on platforms without futex support. Same epoch protocol as the
//! futex implementation, with the epoch guarded by a mutex.

use super::Parking;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub struct FallbackParking {
    /// Wake epoch
    epoch: Mutex<u64>,

    condvar: Condvar,

    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for FallbackParking {
    fn park_unless(&self, ready: &dyn Fn() -> bool, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.epoch.lock();
        let seen = *guard;

        // Wakers bump the epoch under this lock, so checking here is race-free.
        if ready() {
            drop(guard);
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return true;
        }

        // Unrepresentable deadlines wait without one.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut woken = true;
        while *guard == seen {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                        woken = *guard != seen;
                        break;
                    }
                }
                None => self.condvar.wait(&mut guard),
            }
        }
        drop(guard);

        self.parked.fetch_sub(1, Ordering::SeqCst);
        woken
    }

    fn wake_one(&self) {
        *self.epoch.lock() += 1;
        if self.parked.load(Ordering::SeqCst) == 0 {
            return;
        }
        self.condvar.notify_one();
    }

    fn wake_all(&self) {
        *self.epoch.lock() += 1;
        if self.parked.load(Ordering::SeqCst) == 0 {
            return;
        }
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
