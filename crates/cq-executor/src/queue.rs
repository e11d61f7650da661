//! `CompletionQueue` — one native queue plus its tag registry and
//! shutdown refcount.
//!
//! ```text
//!   Open ──(refcount hits 0)──► ShuttingDown ──(Shutdown event)──► Shutdown
//! ```
//!
//! The refcount starts at 1 for the queue's own hold. Each in-flight
//! operation holds a `UsageScope`, which joins the refcount on creation and
//! leaves it on drop. `shutdown()` releases the queue's own hold; whichever
//! release brings the count to zero issues the native shutdown request,
//! so it is issued exactly once and only after every operation finished.

use cq_core::engine::NativeEngine;
use cq_core::error::{CqError, Result};
use cq_core::event::{CompletionEvent, QueueHandle, QueueKind};
use cq_core::refcount::AtomicRefcount;
use cq_core::tag::CompletionTag;

use crate::registry::TagRegistry;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Open = 0,
    /// Native shutdown requested; waiting for the terminal event.
    ShuttingDown = 1,
    /// Terminal event observed.
    Shutdown = 2,
}

impl QueueState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueueState::Open,
            1 => QueueState::ShuttingDown,
            _ => QueueState::Shutdown,
        }
    }
}

pub struct CompletionQueue {
    engine: Arc<dyn NativeEngine>,
    handle: QueueHandle,
    kind: QueueKind,
    registry: TagRegistry,
    refcount: AtomicRefcount,
    state: AtomicU8,
    /// Set by `shutdown()`. New operations are refused from here on even
    /// while earlier ones still hold the queue open.
    closing: AtomicBool,
    disposed: AtomicBool,
}

impl CompletionQueue {
    pub fn create(engine: Arc<dyn NativeEngine>, kind: QueueKind) -> Result<Arc<Self>> {
        let handle = engine.create_queue(kind)?;
        tracing::debug!(cq = handle.0, ?kind, "completion queue created");
        Ok(Arc::new(Self {
            engine,
            handle,
            kind,
            registry: TagRegistry::new(),
            refcount: AtomicRefcount::new(1),
            state: AtomicU8::new(QueueState::Open as u8),
            closing: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    #[inline]
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    #[inline]
    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Current refcount, including the queue's own hold until `shutdown()`.
    pub fn refcount(&self) -> usize {
        self.refcount.count()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Join the queue for one operation.
    ///
    /// Fails with `QueueShuttingDown` once `shutdown()` was called or the
    /// refcount already reached zero. The caller must not submit anything
    /// to the engine in that case.
    pub fn begin_operation(self: &Arc<Self>) -> Result<UsageScope> {
        if self.is_closing() || !self.refcount.increment_if_nonzero() {
            return Err(CqError::QueueShuttingDown);
        }
        Ok(UsageScope {
            cq: Arc::clone(self),
        })
    }

    /// Release one hold. The release that reaches zero requests native
    /// shutdown.
    fn end_operation(&self) {
        if self.refcount.decrement() == 0 {
            self.state
                .store(QueueState::ShuttingDown as u8, Ordering::Release);
            tracing::debug!(cq = self.handle.0, "refcount reached zero, requesting native shutdown");
            self.engine.queue_shutdown(self.handle);
        }
    }

    /// Release the queue's own hold.
    ///
    /// Native shutdown follows as soon as every in-flight operation has
    /// released its scope. A second call returns `AlreadyShutdown`.
    pub fn shutdown(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Err(CqError::AlreadyShutdown);
        }
        tracing::debug!(
            cq = self.handle.0,
            in_flight = self.refcount.count() - 1,
            "completion queue shutdown"
        );
        self.end_operation();
        Ok(())
    }

    fn observe(&self, event: CompletionEvent) -> CompletionEvent {
        if event.is_shutdown() {
            self.state.store(QueueState::Shutdown as u8, Ordering::Release);
        }
        event
    }

    /// Block for the next event on this queue. `None` waits forever.
    pub fn next(&self, timeout: Option<Duration>) -> CompletionEvent {
        self.observe(self.engine.queue_next(self.handle, timeout))
    }

    /// Block for the event of one specific tag. Pluck-kind queues only.
    pub fn pluck(&self, tag: CompletionTag, timeout: Option<Duration>) -> Result<CompletionEvent> {
        if self.kind != QueueKind::Pluck {
            return Err(CqError::WrongQueueKind(self.kind));
        }
        Ok(self.observe(self.engine.queue_pluck(self.handle, tag, timeout)))
    }

    /// Release the native queue.
    ///
    /// Only valid once the terminal event was observed; anything earlier
    /// returns `DisposeBeforeShutdown` and leaves the queue untouched.
    pub fn dispose(&self) -> Result<()> {
        if self.state() != QueueState::Shutdown {
            return Err(CqError::DisposeBeforeShutdown);
        }
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.engine.queue_destroy(self.handle);
            tracing::debug!(cq = self.handle.0, "completion queue disposed");
        }
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.state() == QueueState::Shutdown {
            self.engine.queue_destroy(self.handle);
        } else {
            // Destroying a queue with a live native side would let the
            // engine post into freed state. Leak it instead.
            tracing::warn!(
                cq = self.handle.0,
                state = ?self.state(),
                pending = self.registry.pending(),
                "completion queue dropped before shutdown completed; leaking native queue"
            );
        }
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("refcount", &self.refcount.count())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Hold on a `CompletionQueue` for the lifetime of one operation.
///
/// Dropping the scope releases the hold, whatever path the operation took.
#[must_use = "dropping the scope immediately releases the queue"]
pub struct UsageScope {
    cq: Arc<CompletionQueue>,
}

impl UsageScope {
    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }
}

impl Drop for UsageScope {
    fn drop(&mut self) {
        self.cq.end_operation();
    }
}

impl std::fmt::Debug for UsageScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageScope")
            .field("cq", &self.cq.handle)
            .finish()
    }
}
