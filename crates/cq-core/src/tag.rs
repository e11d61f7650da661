//! Completion tag type

use core::fmt;

/// Opaque token correlating one in-flight operation with its completion.
///
/// Pointer-sized on purpose: the engine carries it verbatim in the event it
/// posts for the operation, and the registry looks the callback up by bit
/// equality. The value 0 is reserved as "no tag".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CompletionTag(u64);

impl CompletionTag {
    /// Sentinel value indicating no tag
    pub const NONE: CompletionTag = CompletionTag(0);

    /// Wrap a raw value received from the engine
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        CompletionTag(raw)
    }

    /// Get the raw value passed to the engine
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for CompletionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "CompletionTag(NONE)")
        } else {
            write!(f, "CompletionTag({:#x})", self.0)
        }
    }
}

impl fmt::Display for CompletionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Default for CompletionTag {
    fn default() -> Self {
        CompletionTag::NONE
    }
}
