//! `LoopbackEngine` — in-process `NativeEngine` implementation.
//!
//! Models the engine side of the completion-queue contract without a
//! transport. Batches started through `start_batch()` stay in flight until
//! the test (or smoke run) completes them with `complete()` / `cancel()`,
//! which fills the batch context and posts the event, exactly as a native
//! engine would when the network operation finishes.
//!
//! ```text
//!   core                        LoopbackEngine                 driver
//!   ────                        ──────────────                 ──────
//!   start_batch(cq, tag, ctx) → inflight[tag] = ctx
//!                                                     ← complete(cq, tag, ..)
//!                               ctx.fill(status, payload)
//!                               post (tag, success) → store
//!   queue_next(cq)            ← pop store / park
//! ```
//!
//! Next-kind queues keep events in a lock-free `SegQueue`. Pluck-kind
//! queues keep them in a map keyed by tag so `queue_pluck()` can take a
//! specific one.
//!
//! Once shutdown was requested and no batch is in flight the queue is
//! terminal: every poller receives `Shutdown` after the remaining events
//! have been handed out.
//!
//! `queue_destroy()` drops the queue's state. Only its shutdown-request
//! count is kept, for the diagnostics accessors.

use cq_core::context::BatchContext;
use cq_core::engine::NativeEngine;
use cq_core::error::{CqError, ProtocolViolation, Result};
use cq_core::event::{CompletionEvent, QueueHandle, QueueKind};
use cq_core::status::Status;
use cq_core::tag::CompletionTag;

use crate::parking::{Parking, PlatformParking};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum EventStore {
    Next(SegQueue<(CompletionTag, bool)>),
    Pluck(Mutex<HashMap<CompletionTag, bool>>),
}

struct LoopbackQueue {
    kind: QueueKind,
    store: EventStore,
    /// Batches accepted but not yet completed.
    inflight: Mutex<HashMap<CompletionTag, Arc<BatchContext>>>,
    /// Mirrors `inflight.len()`; updated only after the event is posted.
    pending: AtomicUsize,
    shutdown_requested: AtomicBool,
    shutdown_requests: AtomicUsize,
    destroyed: AtomicBool,
    parking: PlatformParking,
}

impl LoopbackQueue {
    fn new(kind: QueueKind) -> Self {
        let store = match kind {
            QueueKind::Next => EventStore::Next(SegQueue::new()),
            QueueKind::Pluck => EventStore::Pluck(Mutex::new(HashMap::new())),
        };
        Self {
            kind,
            store,
            inflight: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            shutdown_requested: AtomicBool::new(false),
            shutdown_requests: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            parking: PlatformParking::new(),
        }
    }

    fn is_terminal(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
            || (self.shutdown_requested.load(Ordering::SeqCst)
                && self.pending.load(Ordering::SeqCst) == 0)
    }

    fn pop_any(&self) -> Option<(CompletionTag, bool)> {
        match &self.store {
            EventStore::Next(q) => q.pop(),
            EventStore::Pluck(m) => {
                let mut m = m.lock();
                let tag = *m.keys().next()?;
                m.remove(&tag).map(|success| (tag, success))
            }
        }
    }

    fn pop_tag(&self, tag: CompletionTag) -> Option<bool> {
        match &self.store {
            EventStore::Next(_) => None,
            EventStore::Pluck(m) => m.lock().remove(&tag),
        }
    }

    fn has_any(&self) -> bool {
        match &self.store {
            EventStore::Next(q) => !q.is_empty(),
            EventStore::Pluck(m) => !m.lock().is_empty(),
        }
    }

    fn has_tag(&self, tag: CompletionTag) -> bool {
        match &self.store {
            EventStore::Next(_) => false,
            EventStore::Pluck(m) => m.lock().contains_key(&tag),
        }
    }

    fn post(&self, tag: CompletionTag, success: bool) {
        match &self.store {
            EventStore::Next(q) => {
                q.push((tag, success));
                self.parking.wake_one();
            }
            EventStore::Pluck(m) => {
                m.lock().insert(tag, success);
                // Pluckers wait for specific tags; only the owner can use it.
                self.parking.wake_all();
            }
        }
    }

    fn remaining(deadline: Option<Instant>) -> Option<Option<Duration>> {
        match deadline {
            None => Some(None),
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    None
                } else {
                    Some(Some(d - now))
                }
            }
        }
    }

    fn next(&self, timeout: Option<Duration>) -> CompletionEvent {
        let deadline = deadline_after(timeout);
        loop {
            if let Some((tag, success)) = self.pop_any() {
                return CompletionEvent::OpComplete { tag, success };
            }
            if self.is_terminal() {
                // The last completion is posted before `pending` drops to
                // zero, so it is visible here and goes out first.
                if let Some((tag, success)) = self.pop_any() {
                    return CompletionEvent::OpComplete { tag, success };
                }
                return CompletionEvent::Shutdown;
            }
            let wait = match Self::remaining(deadline) {
                Some(wait) => wait,
                None => return CompletionEvent::Timeout,
            };
            self.parking
                .park_unless(&|| self.has_any() || self.is_terminal(), wait);
        }
    }

    fn pluck(&self, tag: CompletionTag, timeout: Option<Duration>) -> CompletionEvent {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(success) = self.pop_tag(tag) {
                return CompletionEvent::OpComplete { tag, success };
            }
            if self.is_terminal() {
                if let Some(success) = self.pop_tag(tag) {
                    return CompletionEvent::OpComplete { tag, success };
                }
                return CompletionEvent::Shutdown;
            }
            let wait = match Self::remaining(deadline) {
                Some(wait) => wait,
                None => return CompletionEvent::Timeout,
            };
            self.parking
                .park_unless(&|| self.has_tag(tag) || self.is_terminal(), wait);
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1
            && self.shutdown_requested.load(Ordering::SeqCst)
        {
            self.parking.wake_all();
        }
    }
}

/// `None` (wait forever) when `timeout` is `None` or too large to
/// represent as an `Instant`.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

pub struct LoopbackEngine {
    queues: Mutex<HashMap<QueueHandle, Arc<LoopbackQueue>>>,
    /// Destroyed queues: handle → shutdown requests seen.
    retired: Mutex<HashMap<QueueHandle, usize>>,
    next_handle: AtomicU64,
    /// Log of accepted batches, drained by `take_started()`.
    started: SegQueue<(QueueHandle, CompletionTag)>,
    started_parking: PlatformParking,
    reject_batches: AtomicBool,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            started: SegQueue::new(),
            started_parking: PlatformParking::new(),
            reject_batches: AtomicBool::new(false),
        }
    }

    fn queue(&self, cq: QueueHandle) -> Result<Arc<LoopbackQueue>> {
        self.queues
            .lock()
            .get(&cq)
            .cloned()
            .ok_or(CqError::UnknownQueue(cq.0))
    }

    fn is_retired(&self, cq: QueueHandle) -> bool {
        self.retired.lock().contains_key(&cq)
    }

    /// Event for a handle with no live queue. Destroyed queues stay
    /// terminal.
    fn gone(&self, cq: QueueHandle, op: &'static str) -> CompletionEvent {
        if !self.is_retired(cq) {
            tracing::warn!(cq = cq.0, op, "unknown queue");
        }
        CompletionEvent::Shutdown
    }

    /// Finish an in-flight batch: fill its context, then post the event.
    pub fn complete(
        &self,
        cq: QueueHandle,
        tag: CompletionTag,
        success: bool,
        status: Status,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let q = self.queue(cq)?;
        let ctx = q
            .inflight
            .lock()
            .remove(&tag)
            .ok_or(ProtocolViolation::UnknownTag(tag))?;
        ctx.fill(status, payload);
        // Release our reference first so the context can be recycled.
        drop(ctx);
        tracing::trace!(cq = cq.0, %tag, success, "loopback completion");
        q.post(tag, success);
        q.finish_one();
        Ok(())
    }

    /// Successful completion carrying `payload`.
    pub fn complete_ok(&self, cq: QueueHandle, tag: CompletionTag, payload: &[u8]) -> Result<()> {
        self.complete(cq, tag, true, Status::ok(), Some(payload))
    }

    /// Completion reporting that the operation was cancelled.
    pub fn cancel(&self, cq: QueueHandle, tag: CompletionTag) -> Result<()> {
        self.complete(cq, tag, false, Status::cancelled("Cancelled"), None)
    }

    /// Post a raw event that no accepted batch backs.
    ///
    /// For fault-injection: lets tests hand pollers tags the registry
    /// has never seen.
    pub fn inject(&self, cq: QueueHandle, tag: CompletionTag, success: bool) -> Result<()> {
        let q = self.queue(cq)?;
        if q.is_terminal() {
            return Err(CqError::Engine("queue already shut down".into()));
        }
        q.post(tag, success);
        Ok(())
    }

    /// Drain the log of accepted batches.
    pub fn take_started(&self) -> Vec<(QueueHandle, CompletionTag)> {
        let mut out = Vec::new();
        while let Some(entry) = self.started.pop() {
            out.push(entry);
        }
        out
    }

    /// Wait for the next accepted batch.
    pub fn wait_started(&self, timeout: Duration) -> Option<(QueueHandle, CompletionTag)> {
        let deadline = deadline_after(Some(timeout));
        loop {
            if let Some(entry) = self.started.pop() {
                return Some(entry);
            }
            let wait = match LoopbackQueue::remaining(deadline) {
                Some(wait) => wait,
                None => return None,
            };
            self.started_parking
                .park_unless(&|| !self.started.is_empty(), wait);
        }
    }

    /// Batches accepted on `cq` and not yet completed.
    pub fn pending(&self, cq: QueueHandle) -> usize {
        self.queue(cq)
            .map(|q| q.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// How many times `queue_shutdown()` was called for `cq`.
    pub fn shutdown_requests(&self, cq: QueueHandle) -> usize {
        match self.queue(cq) {
            Ok(q) => q.shutdown_requests.load(Ordering::SeqCst),
            Err(_) => self.retired.lock().get(&cq).copied().unwrap_or(0),
        }
    }

    pub fn is_destroyed(&self, cq: QueueHandle) -> bool {
        self.is_retired(cq)
    }

    /// Queues created and not yet destroyed.
    pub fn live_queues(&self) -> usize {
        self.queues.lock().len()
    }

    /// Make `start_batch()` fail, to exercise submission error paths.
    pub fn set_reject_batches(&self, reject: bool) {
        self.reject_batches.store(reject, Ordering::SeqCst);
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for LoopbackEngine {
    fn create_queue(&self, kind: QueueKind) -> Result<QueueHandle> {
        let handle = QueueHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.queues
            .lock()
            .insert(handle, Arc::new(LoopbackQueue::new(kind)));
        tracing::debug!(cq = handle.0, ?kind, "loopback queue created");
        Ok(handle)
    }

    fn queue_next(&self, cq: QueueHandle, timeout: Option<Duration>) -> CompletionEvent {
        match self.queue(cq) {
            Ok(q) => q.next(timeout),
            Err(_) => self.gone(cq, "next"),
        }
    }

    fn queue_pluck(
        &self,
        cq: QueueHandle,
        tag: CompletionTag,
        timeout: Option<Duration>,
    ) -> CompletionEvent {
        match self.queue(cq) {
            Ok(q) if q.kind == QueueKind::Pluck => q.pluck(tag, timeout),
            Ok(_) => {
                tracing::error!(cq = cq.0, %tag, "pluck on a next-kind queue");
                CompletionEvent::Shutdown
            }
            Err(_) => self.gone(cq, "pluck"),
        }
    }

    fn queue_shutdown(&self, cq: QueueHandle) {
        let Ok(q) = self.queue(cq) else {
            tracing::warn!(cq = cq.0, "shutdown of unknown queue");
            return;
        };
        q.shutdown_requests.fetch_add(1, Ordering::SeqCst);
        q.shutdown_requested.store(true, Ordering::SeqCst);
        tracing::debug!(cq = cq.0, pending = q.pending.load(Ordering::SeqCst), "loopback queue shutdown requested");
        q.parking.wake_all();
    }

    fn queue_destroy(&self, cq: QueueHandle) {
        let Some(q) = self.queues.lock().remove(&cq) else {
            if !self.is_retired(cq) {
                tracing::warn!(cq = cq.0, "destroy of unknown queue");
            }
            return;
        };
        q.destroyed.store(true, Ordering::SeqCst);
        q.inflight.lock().clear();
        self.retired
            .lock()
            .insert(cq, q.shutdown_requests.load(Ordering::SeqCst));
        tracing::debug!(cq = cq.0, "loopback queue destroyed");
        // Pollers still parked on it hold their own reference.
        q.parking.wake_all();
    }

    fn start_batch(
        &self,
        cq: QueueHandle,
        tag: CompletionTag,
        ctx: Arc<BatchContext>,
    ) -> Result<()> {
        if self.reject_batches.load(Ordering::SeqCst) {
            return Err(CqError::Engine("batch rejected".into()));
        }
        let q = self.queue(cq)?;
        {
            let mut inflight = q.inflight.lock();
            if q.shutdown_requested.load(Ordering::SeqCst) || q.destroyed.load(Ordering::SeqCst) {
                return Err(CqError::Engine("queue already shut down".into()));
            }
            if inflight.contains_key(&tag) {
                return Err(ProtocolViolation::DuplicateTag(tag).into());
            }
            inflight.insert(tag, ctx);
            q.pending.fetch_add(1, Ordering::SeqCst);
        }
        self.started.push((cq, tag));
        self.started_parking.wake_all();
        Ok(())
    }
}
