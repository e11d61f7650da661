//! Library defaults for `PoolConfig`.

/// Poller threads.
pub const POOL_SIZE: usize = 2;

/// Completion queues shared by the pollers.
pub const QUEUE_COUNT: usize = 1;

/// Upper bound on poller threads.
pub const MAX_POOL_SIZE: usize = 256;

/// Poll timeout in milliseconds. 0 blocks until an event arrives.
pub const POLL_TIMEOUT_MS: u64 = 0;

/// Upper bound on a finite poll timeout (one hour).
pub const MAX_POLL_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Idle `BatchContext` values kept for reuse.
pub const CONTEXT_POOL_CAPACITY: usize = 256;
