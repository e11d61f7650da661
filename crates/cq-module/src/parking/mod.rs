//! Poller parking
//!
//! Blocks threads waiting in `queue_next()` / `queue_pluck()` until an event
//! is posted. Platform-specific implementations use the most efficient
//! primitive available.
//!
//! Both implementations are epoch based: a waker bumps the epoch before
//! waking, and a parker only sleeps if the epoch it read before checking
//! its condition is still current. An event posted between the condition
//! check and the sleep therefore cannot be missed.

use std::time::Duration;

pub trait Parking: Send + Sync {
    /// Sleep until woken or `timeout` passes, unless `ready()` already
    /// holds. `ready` is evaluated after the parker has registered itself.
    ///
    /// Returns `true` if `ready()` held or a wake arrived, `false` on
    /// timeout or spurious return. Callers must re-check their condition
    /// either way.
    fn park_unless(&self, ready: &dyn Fn() -> bool, timeout: Option<Duration>) -> bool;

    /// Wake one parked thread.
    fn wake_one(&self);

    /// Wake every parked thread.
    fn wake_all(&self);

    /// Number of currently parked threads (hint, may be stale).
    fn parked_count(&self) -> usize;
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn Parking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn park_times_out() {
        let parking = new_parking();
        let start = Instant::now();
        let woken = parking.park_unless(&|| false, Some(Duration::from_millis(50)));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(parking.parked_count(), 0);
    }

    #[test]
    fn ready_condition_skips_sleep() {
        let parking = new_parking();
        let start = Instant::now();
        assert!(parking.park_unless(&|| true, Some(Duration::from_secs(10))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wake_one_releases_parked_thread() {
        let parking = Arc::new(PlatformParking::new());
        let flag = Arc::new(AtomicBool::new(false));

        let handle = {
            let parking = Arc::clone(&parking);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let start = Instant::now();
                while !flag.load(Ordering::SeqCst) {
                    parking.park_unless(
                        &|| flag.load(Ordering::SeqCst),
                        Some(Duration::from_secs(10)),
                    );
                }
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::SeqCst);
        parking.wake_one();

        let elapsed = handle.join().unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn max_timeout_parks_until_woken() {
        let parking = Arc::new(PlatformParking::new());
        let flag = Arc::new(AtomicBool::new(false));

        let handle = {
            let parking = Arc::clone(&parking);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    parking.park_unless(&|| flag.load(Ordering::SeqCst), Some(Duration::MAX));
                }
            })
        };

        thread::sleep(Duration::from_millis(30));
        flag.store(true, Ordering::SeqCst);
        parking.wake_all();
        handle.join().unwrap();
        assert_eq!(parking.parked_count(), 0);
    }
}
