//! `AsyncOperationBridge` — turns the (tag, callback) protocol into
//! caller-facing deferred results.
//!
//! ```text
//!   submit(decode)
//!     scope  = queue.begin_operation()        // refused once shutting down
//!     tag    = registry.next_tag()
//!     ctx    = contexts.take()
//!     (resolver, deferred) = deferred(tag)
//!     registry.register(tag, |success| {      // runs on a poller thread
//!         resolver.resolve(classify(success, ctx, decode));
//!         contexts.give(ctx);
//!         drop(scope);
//!     })
//!     engine.start_batch(queue, tag, ctx)
//!     return deferred
//! ```
//!
//! Every outcome the engine can report is turned into exactly one
//! resolution. Decode failures and decode panics resolve as `Failed`
//! instead of escaping the callback.

use cq_core::context::BatchContext;
use cq_core::engine::NativeEngine;
use cq_core::error::{CqError, Result};
use cq_core::event::{CompletionEvent, QueueKind};
use cq_core::status::Status;
use cq_module::ContextPool;

use crate::deferred::{deferred, CallError, CallResult, Deferred};
use crate::queue::CompletionQueue;

use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const DESERIALIZE_FAILED: &str = "Failed to deserialize response message.";

#[derive(Clone)]
pub struct AsyncOperationBridge {
    engine: Arc<dyn NativeEngine>,
    queues: Arc<Vec<Arc<CompletionQueue>>>,
    next: Arc<AtomicUsize>,
    contexts: Arc<ContextPool>,
}

impl AsyncOperationBridge {
    /// `queues` must not be empty.
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        queues: Vec<Arc<CompletionQueue>>,
        contexts: Arc<ContextPool>,
    ) -> Result<Self> {
        if queues.is_empty() {
            return Err(CqError::InvalidConfig("bridge needs at least one queue"));
        }
        Ok(Self {
            engine,
            queues: Arc::new(queues),
            next: Arc::new(AtomicUsize::new(0)),
            contexts,
        })
    }

    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    pub fn contexts(&self) -> &Arc<ContextPool> {
        &self.contexts
    }

    /// Next queue in round-robin order.
    pub fn pick_queue(&self) -> &Arc<CompletionQueue> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        &self.queues[i]
    }

    /// Submit one operation on the next queue.
    pub fn submit<T, E, F>(&self, decode: F) -> Result<Deferred<T>>
    where
        T: Send + 'static,
        E: Display,
        F: FnOnce(&[u8]) -> std::result::Result<T, E> + Send + 'static,
    {
        let queue = Arc::clone(self.pick_queue());
        self.submit_on(&queue, decode)
    }

    /// Submit one operation on `queue`.
    ///
    /// `decode` runs on the poller thread that receives the completion,
    /// over the payload the engine delivered.
    pub fn submit_on<T, E, F>(&self, queue: &Arc<CompletionQueue>, decode: F) -> Result<Deferred<T>>
    where
        T: Send + 'static,
        E: Display,
        F: FnOnce(&[u8]) -> std::result::Result<T, E> + Send + 'static,
    {
        let scope = queue.begin_operation()?;
        let registry = queue.registry();
        let tag = registry.next_tag();
        let ctx = self.contexts.take();
        let (resolver, result) = deferred(tag);

        let contexts = Arc::clone(&self.contexts);
        let callback_ctx = Arc::clone(&ctx);
        registry.register(
            tag,
            Box::new(move |success| {
                let outcome = classify(success, &callback_ctx, decode);
                contexts.give(callback_ctx);
                resolver.resolve(outcome);
                drop(scope);
            }),
        )?;

        if let Err(e) = self.engine.start_batch(queue.handle(), tag, ctx) {
            // No event will ever arrive for this tag.
            tracing::debug!(%tag, error = %e, "batch rejected by engine");
            drop(registry.extract(tag));
            return Err(e);
        }
        tracing::trace!(cq = queue.handle().0, %tag, "operation submitted");
        Ok(result)
    }

    /// Run one operation synchronously on a private pluck queue.
    pub fn invoke_blocking<T, E, F>(&self, decode: F) -> Result<CallResult<T>>
    where
        E: Display,
        F: FnOnce(&[u8]) -> std::result::Result<T, E>,
    {
        invoke_blocking(&self.engine, decode)
    }
}

impl std::fmt::Debug for AsyncOperationBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperationBridge")
            .field("queues", &self.queues.len())
            .field("idle_contexts", &self.contexts.idle())
            .finish()
    }
}

/// Map a completion to the caller-facing outcome.
///
/// - status `Cancelled` → `Cancelled`, whatever the success flag says
/// - any other non-OK status → `Failed(status)`
/// - failed batch with OK status → `Failed(Internal)`
/// - no payload, decode error or decode panic → `Failed(Internal)`
pub(crate) fn classify<T, E, F>(success: bool, ctx: &BatchContext, decode: F) -> CallResult<T>
where
    E: Display,
    F: FnOnce(&[u8]) -> std::result::Result<T, E>,
{
    let status = ctx.status().unwrap_or_default();
    if status.is_cancelled() {
        return Err(CallError::Cancelled(status));
    }
    if !status.is_ok() {
        return Err(CallError::Failed(status));
    }
    if !success {
        return Err(CallError::Failed(Status::internal("operation failed")));
    }

    let decoded = catch_unwind(AssertUnwindSafe(|| ctx.with_payload(|payload| payload.map(decode))));
    match decoded {
        Ok(Some(Ok(value))) => Ok(value),
        Ok(Some(Err(e))) => {
            tracing::debug!(error = %e, "response decode failed");
            Err(CallError::Failed(Status::internal(format!(
                "{} {}",
                DESERIALIZE_FAILED, e
            ))))
        }
        Ok(None) => Err(CallError::Failed(Status::internal(DESERIALIZE_FAILED))),
        Err(_) => {
            tracing::error!("response decoder panicked");
            Err(CallError::Failed(Status::internal(DESERIALIZE_FAILED)))
        }
    }
}

/// Run one operation to completion on a private pluck-kind queue.
///
/// The queue is created, used for this single tag, shut down, drained to
/// its terminal event and disposed before returning. There is no timeout
/// at this layer; deadlines are the engine's business.
pub fn invoke_blocking<T, E, F>(engine: &Arc<dyn NativeEngine>, decode: F) -> Result<CallResult<T>>
where
    E: Display,
    F: FnOnce(&[u8]) -> std::result::Result<T, E>,
{
    let cq = CompletionQueue::create(Arc::clone(engine), QueueKind::Pluck)?;
    let scope = cq.begin_operation()?;
    let tag = cq.registry().next_tag();
    let ctx = Arc::new(BatchContext::new());

    let outcome = match engine.start_batch(cq.handle(), tag, Arc::clone(&ctx)) {
        Ok(()) => {
            let success = loop {
                match cq.pluck(tag, None)? {
                    CompletionEvent::OpComplete { success, .. } => break Some(success),
                    CompletionEvent::Timeout => continue,
                    CompletionEvent::Shutdown => break None,
                }
            };
            Ok(match success {
                Some(success) => classify(success, &ctx, decode),
                None => Err(CallError::Failed(Status::internal(
                    "queue shut down before the operation completed",
                ))),
            })
        }
        Err(e) => Err(e),
    };

    drop(scope);
    cq.shutdown()?;
    while !cq.next(None).is_shutdown() {}
    cq.dispose()?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_core::status::StatusCode;

    fn decode_u32(bytes: &[u8]) -> std::result::Result<u32, String> {
        let arr: [u8; 4] = bytes.try_into().map_err(|_| format!("expected 4 bytes, got {}", bytes.len()))?;
        Ok(u32::from_le_bytes(arr))
    }

    fn ctx(status: Status, payload: Option<&[u8]>) -> BatchContext {
        let ctx = BatchContext::new();
        ctx.fill(status, payload);
        ctx
    }

    #[test]
    fn success_decodes_payload() {
        let c = ctx(Status::ok(), Some(&9u32.to_le_bytes()));
        assert_eq!(classify(true, &c, decode_u32), Ok(9));
    }

    #[test]
    fn cancelled_status_wins_over_flag() {
        for success in [true, false] {
            let c = ctx(Status::cancelled("Cancelled"), None);
            let err = classify(success, &c, decode_u32).unwrap_err();
            assert!(err.is_cancelled());
        }
    }

    #[test]
    fn error_status_is_failure() {
        let c = ctx(Status::new(StatusCode::Unavailable, "connect failed"), None);
        assert_eq!(
            classify(false, &c, decode_u32),
            Err(CallError::Failed(Status::new(StatusCode::Unavailable, "connect failed")))
        );
    }

    #[test]
    fn failed_batch_with_ok_status_is_internal() {
        let c = ctx(Status::ok(), Some(&1u32.to_le_bytes()));
        let err = classify(false, &c, decode_u32).unwrap_err();
        assert_eq!(err.status().code, StatusCode::Internal);
    }

    #[test]
    fn missing_payload_is_internal() {
        let c = ctx(Status::ok(), None);
        let err = classify(true, &c, decode_u32).unwrap_err();
        assert_eq!(err.status(), &Status::internal(DESERIALIZE_FAILED));
    }

    #[test]
    fn decode_error_is_internal() {
        let c = ctx(Status::ok(), Some(b"xy"));
        let err = classify(true, &c, decode_u32).unwrap_err();
        assert_eq!(err.status().code, StatusCode::Internal);
        assert!(err.status().detail.starts_with(DESERIALIZE_FAILED));
        assert!(err.status().detail.contains("got 2"));
    }

    #[test]
    fn decode_panic_is_internal() {
        let c = ctx(Status::ok(), Some(b""));
        let err = classify(true, &c, |_: &[u8]| -> std::result::Result<u32, String> {
            panic!("bad decoder")
        })
        .unwrap_err();
        assert_eq!(err.status().code, StatusCode::Internal);
        // The context lock was released during unwinding.
        c.reset();
    }

    /// Counts WARN and ERROR events.
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let level = *event.metadata().level();
            if level == tracing::Level::WARN || level == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn rejected_batch_is_reported_without_warnings() {
        use tracing_subscriber::layer::SubscriberExt;

        let loopback = Arc::new(cq_module::LoopbackEngine::new());
        let engine: Arc<dyn NativeEngine> = loopback.clone();
        let cq = CompletionQueue::create(Arc::clone(&engine), QueueKind::Next).unwrap();
        let bridge =
            AsyncOperationBridge::new(engine, vec![Arc::clone(&cq)], Arc::new(ContextPool::new(4)))
                .unwrap();
        loopback.set_reject_batches(true);

        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));
        let outcome = tracing::subscriber::with_default(subscriber, || bridge.submit(decode_u32));

        assert!(matches!(outcome, Err(CqError::Engine(_))));
        assert_eq!(warnings.load(Ordering::SeqCst), 0);
        assert!(cq.registry().is_empty());
        assert_eq!(cq.refcount(), 1);

        cq.shutdown().unwrap();
        assert!(cq.next(None).is_shutdown());
        cq.dispose().unwrap();
    }

    #[test]
    fn bridge_requires_a_queue() {
        let engine: Arc<dyn NativeEngine> = Arc::new(cq_module::LoopbackEngine::new());
        let err = AsyncOperationBridge::new(engine, Vec::new(), Arc::new(ContextPool::new(1))).unwrap_err();
        assert!(matches!(err, CqError::InvalidConfig(_)));
    }
}
