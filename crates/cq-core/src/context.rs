//! Per-operation batch context.
//!
//! A `BatchContext` is the slot the engine writes an operation's results
//! into (final status, received payload) before it posts the completion
//! event. The completion callback reads it on the poller thread.
//!
//! Contexts are recycled: `reset()` clears the previous operation's results
//! but keeps the payload buffer's capacity.

use crate::status::Status;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct BatchState {
    status: Option<Status>,
    payload: Vec<u8>,
    has_payload: bool,
}

#[derive(Debug, Default)]
pub struct BatchContext {
    state: Mutex<BatchState>,
}

impl BatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of the batch. Called by the engine.
    pub fn fill(&self, status: Status, payload: Option<&[u8]>) {
        let mut state = self.state.lock();
        state.status = Some(status);
        state.payload.clear();
        state.has_payload = payload.is_some();
        if let Some(bytes) = payload {
            state.payload.extend_from_slice(bytes);
        }
    }

    /// Final status, if the engine reported one.
    pub fn status(&self) -> Option<Status> {
        self.state.lock().status.clone()
    }

    /// Run `f` over the received payload (`None` when nothing was received).
    pub fn with_payload<R>(&self, f: impl FnOnce(Option<&[u8]>) -> R) -> R {
        let state = self.state.lock();
        if state.has_payload {
            f(Some(&state.payload))
        } else {
            f(None)
        }
    }

    /// Forget the previous operation's results.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = None;
        state.payload.clear();
        state.has_payload = false;
    }

    /// Capacity of the payload buffer (kept across `reset`).
    pub fn payload_capacity(&self) -> usize {
        self.state.lock().payload.capacity()
    }
}
