//! `ContextPool` — recycles `BatchContext` values between operations.
//!
//! Every submitted operation needs a context for the engine to write its
//! results into. Allocating one per call adds allocator traffic on the hot
//! path, so finished contexts are reset and parked in a bounded lock-free
//! queue for the next submission.
//!
//! A context is only recycled when the caller holds the last reference:
//! a context still visible to the engine or to a callback is never handed
//! to a second operation.

use cq_core::context::BatchContext;

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct ContextPool {
    free: ArrayQueue<Arc<BatchContext>>,
    /// Contexts created because the free list was empty.
    allocated: AtomicU64,
    /// Contexts served from the free list.
    reused: AtomicU64,
}

impl ContextPool {
    /// Create a pool keeping at most `capacity` idle contexts.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Take a clean context.
    pub fn take(&self) -> Arc<BatchContext> {
        match self.free.pop() {
            Some(ctx) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                ctx
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Arc::new(BatchContext::new())
            }
        }
    }

    /// Return a context after its operation finished.
    ///
    /// Dropped instead of recycled if anyone else still holds it or the
    /// pool is full.
    pub fn give(&self, ctx: Arc<BatchContext>) {
        if Arc::strong_count(&ctx) != 1 {
            return;
        }
        ctx.reset();
        let _ = self.free.push(ctx);
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}
