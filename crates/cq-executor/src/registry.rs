//! `TagRegistry` — maps completion tags to one-shot callbacks.
//!
//! A submitter registers its callback under a fresh tag before handing the
//! operation to the engine; the poller that receives the completion event
//! extracts the callback and runs it. Exactly one `extract` succeeds per
//! `register`.

use cq_core::error::ProtocolViolation;
use cq_core::tag::CompletionTag;

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Completion callback. Receives the engine's success flag.
pub type PendingCallback = Box<dyn FnOnce(bool) + Send + 'static>;

pub struct TagRegistry {
    callbacks: Mutex<HashMap<CompletionTag, PendingCallback>>,
    /// Source of fresh tags. Starts at 1; 0 is `CompletionTag::NONE`.
    next_tag: AtomicU64,
    /// Registered but not yet extracted.
    pending: AtomicUsize,
    /// Diagnostics only.
    last_registered: AtomicU64,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            last_registered: AtomicU64::new(0),
        }
    }

    /// Allocate a tag no other operation on this registry has used.
    #[inline]
    pub fn next_tag(&self) -> CompletionTag {
        CompletionTag::from_raw(self.next_tag.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(
        &self,
        tag: CompletionTag,
        callback: PendingCallback,
    ) -> Result<(), ProtocolViolation> {
        let mut callbacks = self.callbacks.lock();
        match callbacks.entry(tag) {
            Entry::Occupied(_) => Err(ProtocolViolation::DuplicateTag(tag)),
            Entry::Vacant(slot) => {
                slot.insert(callback);
                self.pending.fetch_add(1, Ordering::AcqRel);
                self.last_registered.store(tag.as_raw(), Ordering::Relaxed);
                tracing::trace!(%tag, "callback registered");
                Ok(())
            }
        }
    }

    pub fn extract(&self, tag: CompletionTag) -> Result<PendingCallback, ProtocolViolation> {
        let callback = self
            .callbacks
            .lock()
            .remove(&tag)
            .ok_or(ProtocolViolation::UnknownTag(tag))?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Ok(callback)
    }

    /// Operations submitted but not yet completed.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn contains(&self, tag: CompletionTag) -> bool {
        self.callbacks.lock().contains_key(&tag)
    }

    pub fn last_registered(&self) -> CompletionTag {
        CompletionTag::from_raw(self.last_registered.load(Ordering::Relaxed))
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TagRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagRegistry")
            .field("pending", &self.pending())
            .field("last_registered", &self.last_registered())
            .finish()
    }
}
