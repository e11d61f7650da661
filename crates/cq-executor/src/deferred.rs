//! Single-assignment deferred results
//!
//! `deferred()` returns a connected `(Resolver, Deferred)` pair. The
//! resolver side lives inside a completion callback and is resolved on a
//! poller thread. The deferred side is handed to the caller, who can block
//! on it (`wait`, `wait_timeout`) or `.await` it from any executor.
//!
//! ```ignore
//! let (resolver, result) = deferred::<u32>(tag);
//! std::thread::spawn(move || resolver.resolve(Ok(7)));
//! assert_eq!(result.wait(), Ok(7));
//! ```
//!
//! A second `resolve()` panics. A resolver dropped without resolving
//! resolves as `Failed(Internal)` so the waiting caller never hangs.

use cq_core::status::Status;
use cq_core::tag::CompletionTag;

use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Caller-facing failure of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The operation was cancelled rather than failed.
    #[error("operation cancelled: {0}")]
    Cancelled(Status),
    #[error("operation failed: {0}")]
    Failed(Status),
}

impl CallError {
    pub fn status(&self) -> &Status {
        match self {
            CallError::Cancelled(status) | CallError::Failed(status) => status,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Cancelled(_))
    }
}

pub type CallResult<T> = std::result::Result<T, CallError>;

struct Slot<T> {
    value: Option<CallResult<T>>,
    resolved: bool,
    waker: Option<Waker>,
}

struct Shared<T> {
    tag: CompletionTag,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Create a connected resolver / deferred pair for the operation `tag`.
pub fn deferred<T>(tag: CompletionTag) -> (Resolver<T>, Deferred<T>) {
    let shared = Arc::new(Shared {
        tag,
        slot: Mutex::new(Slot {
            value: None,
            resolved: false,
            waker: None,
        }),
        ready: Condvar::new(),
    });
    (
        Resolver {
            shared: Arc::clone(&shared),
        },
        Deferred { shared },
    )
}

/// Write side. Resolve exactly once.
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Resolver<T> {
    pub fn tag(&self) -> CompletionTag {
        self.shared.tag
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.slot.lock().resolved
    }

    /// Store the outcome and wake the waiter.
    ///
    /// # Panics
    ///
    /// If the result was already resolved.
    pub fn resolve(&self, result: CallResult<T>) {
        let waker = {
            let mut slot = self.shared.slot.lock();
            assert!(
                !slot.resolved,
                "deferred result for tag {} resolved twice",
                self.shared.tag
            );
            slot.resolved = true;
            slot.value = Some(result);
            slot.waker.take()
        };
        self.shared.ready.notify_all();
        // Outside the lock: the executor may poll again on this thread.
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if !self.is_resolved() {
            tracing::debug!(tag = %self.shared.tag, "resolver dropped without a result");
            self.resolve(Err(CallError::Failed(Status::internal(
                "operation dropped without a result",
            ))));
        }
    }
}

/// Read side. Completes exactly once with the operation's outcome.
pub struct Deferred<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Deferred<T> {
    /// Tag of the operation this result belongs to.
    pub fn tag(&self) -> CompletionTag {
        self.shared.tag
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.slot.lock().resolved
    }

    /// Block the calling thread until resolved.
    pub fn wait(self) -> CallResult<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(value) = slot.value.take() {
                return value;
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`. Gives the deferred back on expiry.
    ///
    /// A timeout too large to express as a deadline waits like `wait()`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<CallResult<T>, Self> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(self.wait());
        };
        {
            let mut slot = self.shared.slot.lock();
            loop {
                if let Some(value) = slot.value.take() {
                    return Ok(value);
                }
                if self
                    .shared
                    .ready
                    .wait_until(&mut slot, deadline)
                    .timed_out()
                {
                    if let Some(value) = slot.value.take() {
                        return Ok(value);
                    }
                    break;
                }
            }
        }
        Err(self)
    }

    /// Take the outcome if it is already there.
    pub fn try_take(self) -> Result<CallResult<T>, Self> {
        let taken = self.shared.slot.lock().value.take();
        match taken {
            Some(value) => Ok(value),
            None => Err(self),
        }
    }
}

impl<T> Future for Deferred<T> {
    type Output = CallResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        if let Some(value) = slot.value.take() {
            return Poll::Ready(value);
        }
        assert!(!slot.resolved, "Deferred polled after completion");
        match &slot.waker {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => slot.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("tag", &self.shared.tag)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_core::status::StatusCode;
    use std::thread;

    fn tag() -> CompletionTag {
        CompletionTag::from_raw(42)
    }

    #[test]
    fn resolve_then_wait() {
        let (resolver, result) = deferred::<u32>(tag());
        assert!(!result.is_resolved());
        resolver.resolve(Ok(7));
        assert!(result.is_resolved());
        assert_eq!(result.tag(), tag());
        assert_eq!(result.wait(), Ok(7));
    }

    #[test]
    fn resolve_from_another_thread() {
        let (resolver, result) = deferred::<String>(tag());
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(Ok("done".to_string()));
        });
        assert_eq!(result.wait(), Ok("done".to_string()));
        t.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "resolved twice")]
    fn double_resolve_panics() {
        let (resolver, _result) = deferred::<u32>(tag());
        resolver.resolve(Ok(1));
        resolver.resolve(Ok(2));
    }

    #[test]
    fn dropped_resolver_fails_internal() {
        let (resolver, result) = deferred::<u32>(tag());
        drop(resolver);
        let err = result.wait().unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(err.status().code, StatusCode::Internal);
    }

    #[test]
    fn wait_timeout_returns_deferred_on_expiry() {
        let (resolver, result) = deferred::<u32>(tag());
        let result = result
            .wait_timeout(Duration::from_millis(10))
            .unwrap_err();
        resolver.resolve(Err(CallError::Cancelled(Status::cancelled("Cancelled"))));
        let outcome = result.wait_timeout(Duration::from_millis(10)).unwrap();
        assert!(outcome.unwrap_err().is_cancelled());
    }

    #[test]
    fn wait_timeout_accepts_max_duration() {
        let (resolver, result) = deferred::<u32>(tag());
        resolver.resolve(Ok(5));
        assert_eq!(result.wait_timeout(Duration::MAX).ok(), Some(Ok(5)));

        let (resolver, result) = deferred::<u32>(tag());
        let waiter = thread::spawn(move || result.wait_timeout(Duration::MAX).ok());
        thread::sleep(Duration::from_millis(20));
        resolver.resolve(Ok(6));
        assert_eq!(waiter.join().unwrap(), Some(Ok(6)));
    }

    #[test]
    fn try_take() {
        let (resolver, result) = deferred::<u32>(tag());
        let result = result.try_take().unwrap_err();
        resolver.resolve(Ok(3));
        assert_eq!(result.try_take().unwrap(), Ok(3));
    }

    #[test]
    fn awaitable() {
        let (resolver, result) = deferred::<u32>(tag());
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(Ok(11));
        });
        assert_eq!(futures::executor::block_on(result), Ok(11));
        t.join().unwrap();
    }

    #[test]
    fn call_error_display() {
        let err = CallError::Failed(Status::new(StatusCode::Unavailable, "down"));
        assert_eq!(
            err.to_string(),
            "operation failed: Status(StatusCode=\"Unavailable\", Detail=\"down\")"
        );
    }
}
