//! # cq-module — Default implementations
//!
//! This crate provides the default implementation for the pieces the
//! dispatch core plugs together.
//!
//! ## Default stack
//!
//! | Concern          | Default Impl     | Alternative                 |
//! |------------------|------------------|-----------------------------|
//! | NativeEngine     | LoopbackEngine   | native binding (external)   |
//! | Parking          | FutexParking     | FallbackParking (non-Linux) |
//! | Context recycling| ContextPool      | —                           |

pub mod parking;
pub mod loopback;
pub mod context_pool;

pub use context_pool::ContextPool;
pub use loopback::LoopbackEngine;
pub use parking::{new_parking, Parking, PlatformParking};
