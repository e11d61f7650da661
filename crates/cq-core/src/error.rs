//! Dispatch core error types.

use crate::event::QueueKind;
use crate::tag::CompletionTag;
use thiserror::Error;

/// Submission/dispatch pairing broken. Always a bug, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// A callback is already registered under this tag.
    #[error("tag {0} registered twice")]
    DuplicateTag(CompletionTag),
    /// Completion arrived for a tag nobody registered.
    #[error("no callback registered for tag {0}")]
    UnknownTag(CompletionTag),
}

#[derive(Debug, Error)]
pub enum CqError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    /// An operation tried to begin after queue shutdown started.
    #[error("completion queue is shutting down")]
    QueueShuttingDown,

    /// `shutdown()` called a second time on the same queue.
    #[error("shutdown has already been called")]
    AlreadyShutdown,

    /// `dispose()` before the terminal shutdown event was observed.
    #[error("completion queue disposed before shutdown completed")]
    DisposeBeforeShutdown,

    #[error("thread pool already started")]
    AlreadyStarted,

    #[error("thread pool is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to spawn poller thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// `pluck()` on a queue created for `next()`.
    #[error("operation not supported by a {0:?} queue")]
    WrongQueueKind(QueueKind),

    /// The engine refused a request.
    #[error("engine error: {0}")]
    Engine(String),

    /// The engine does not know the queue handle.
    #[error("unknown completion queue {0}")]
    UnknownQueue(u64),
}

impl CqError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, CqError::ProtocolViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, CqError>;
