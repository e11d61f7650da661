//! Native engine abstraction.
//!
//! `NativeEngine` is the boundary to the RPC engine that owns the actual
//! completion queues. The dispatch core only ever calls through this trait.
//!
//! # Implementors
//!
//! - `LoopbackEngine` (cq-module): in-process queues with completion
//!   injection. Used by tests and the smoke binary.
//!
//! - A native binding: thin `extern "C"` calls into the engine library.
//!   Not part of this workspace.
//!
//! **Contract:**
//! - Every batch accepted by `start_batch()` yields exactly one
//!   `OpComplete` event carrying the same tag, bit for bit.
//! - The engine fills the batch context before posting the event.
//! - After `queue_shutdown()`, once every accepted batch has completed,
//!   the queue yields `Shutdown` to every poller and no further
//!   `OpComplete` events.
//! - `queue_next()` may be called concurrently from many threads; each
//!   event is delivered to exactly one caller.

use std::sync::Arc;
use std::time::Duration;

use crate::context::BatchContext;
use crate::error::Result;
use crate::event::{CompletionEvent, QueueHandle, QueueKind};
use crate::tag::CompletionTag;

pub trait NativeEngine: Send + Sync {
    /// Allocate a native completion queue.
    fn create_queue(&self, kind: QueueKind) -> Result<QueueHandle>;

    /// Block until the next event on `cq`, or until `timeout` passes
    /// (`None` waits forever). Returns `Timeout` on expiry.
    fn queue_next(&self, cq: QueueHandle, timeout: Option<Duration>) -> CompletionEvent;

    /// Block until the event for `tag` (or the terminal event) arrives.
    fn queue_pluck(
        &self,
        cq: QueueHandle,
        tag: CompletionTag,
        timeout: Option<Duration>,
    ) -> CompletionEvent;

    /// Request shutdown. Issued at most once per queue by the core.
    fn queue_shutdown(&self, cq: QueueHandle);

    /// Release the native queue. Only after the terminal event was seen.
    fn queue_destroy(&self, cq: QueueHandle);

    /// Submit one batch of work whose completion is reported under `tag`.
    fn start_batch(
        &self,
        cq: QueueHandle,
        tag: CompletionTag,
        ctx: Arc<BatchContext>,
    ) -> Result<()>;
}
