//! Completion events and queue identity.
//!
//! These are the values that cross the engine boundary. They are plain
//! `Copy` types so a poller can hand them around without allocation.

use crate::tag::CompletionTag;

/// Result of one blocking poll on a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEvent {
    /// An operation submitted under `tag` finished.
    OpComplete { tag: CompletionTag, success: bool },
    /// The poll deadline passed with nothing to report.
    Timeout,
    /// The queue has shut down. Terminal: nothing follows it.
    Shutdown,
}

impl CompletionEvent {
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CompletionEvent::Shutdown)
    }

    /// Tag of an `OpComplete` event, `None` for the other kinds.
    #[inline]
    pub fn tag(&self) -> Option<CompletionTag> {
        match self {
            CompletionEvent::OpComplete { tag, .. } => Some(*tag),
            _ => None,
        }
    }
}

/// How a queue is meant to be drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Drained by `next()` from any number of poller threads.
    Next,
    /// Waited on per tag via `pluck()` (synchronous-style calls).
    Pluck,
}

/// Engine-side handle of one native completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct QueueHandle(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_only_on_op_complete() {
        let tag = CompletionTag::from_raw(7);
        let ev = CompletionEvent::OpComplete { tag, success: true };
        assert_eq!(ev.tag(), Some(tag));
        assert!(!ev.is_shutdown());
        assert_eq!(CompletionEvent::Timeout.tag(), None);
        assert!(CompletionEvent::Shutdown.is_shutdown());
    }
}
