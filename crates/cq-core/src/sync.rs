//! Atomics with optional loom support.
//!
//! Production builds use `std` atomics. With the `loom` feature the same
//! names resolve to loom's model-checked atomics so that `AtomicRefcount`
//! can be exhaustively tested.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicUsize, Ordering};

/// Spin loop hint for CAS retry loops.
///
/// Under loom this yields so the model checker can schedule other threads.
#[inline]
pub fn spin_loop() {
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();

    #[cfg(feature = "loom")]
    loom::thread::yield_now();
}
