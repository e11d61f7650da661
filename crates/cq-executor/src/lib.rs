//! # cq-executor — Completion queue dispatch
//!
//! Ties the pieces together:
//!
//! ```text
//!   caller ──submit(decode)──► AsyncOperationBridge
//!                                 │ UsageScope + tag + callback
//!                                 ▼
//!                          CompletionQueue ──start_batch──► NativeEngine
//!                                 ▲                             │
//!                                 │ next()                      │ event(tag, ok)
//!                          PollingThreadPool ◄──────────────────┘
//!                                 │ registry.extract(tag)(ok)
//!                                 ▼
//!                          Resolver ──► Deferred ──► caller
//! ```
//!
//! The engine is always passed in explicitly as `Arc<dyn NativeEngine>`;
//! nothing in this crate holds process-wide state apart from the optional
//! logging subscriber.

pub mod registry;
pub mod queue;
pub mod deferred;
pub mod bridge;
pub mod pool;
pub mod config;
pub mod logging;

pub use bridge::{invoke_blocking, AsyncOperationBridge};
pub use config::{ConfigError, PoolConfig};
pub use deferred::{deferred, CallError, CallResult, Deferred, Resolver};
pub use pool::{PollingThreadPool, PoolStats, PoolStatsSnapshot};
pub use queue::{CompletionQueue, QueueState, UsageScope};
pub use registry::{PendingCallback, TagRegistry};
