//! # cq-core — Types and traits for the completion-queue dispatch core
//!
//! This crate defines the vocabulary shared by every other crate in the
//! workspace: completion tags, completion events, RPC status, the shutdown
//! refcount, the per-operation batch context, and the `NativeEngine` trait
//! that models the external RPC engine.
//!
//! ## Design principle
//!
//! > "Program to the interface."
//!
//! The dispatch core never talks to a concrete engine. It holds an
//! `Arc<dyn NativeEngine>` handed to it at construction time, so a native
//! binding and the in-process `LoopbackEngine` are interchangeable.

pub mod tag;
pub mod event;
pub mod status;
pub mod refcount;
pub mod context;
pub mod engine;
pub mod error;
pub mod env;
pub mod sync;

// Re-exports for convenience
pub use tag::CompletionTag;
pub use event::{CompletionEvent, QueueHandle, QueueKind};
pub use status::{Status, StatusCode};
pub use refcount::AtomicRefcount;
pub use context::BatchContext;
pub use engine::NativeEngine;
pub use error::{CqError, ProtocolViolation, Result};
pub use env::{env_get, env_get_bool, env_get_opt};
