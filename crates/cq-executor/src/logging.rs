//! Structured logging initialization.
//!
//! `RUST_LOG` takes precedence. Without it the level comes from
//! `CQ_LOG_LEVEL`, defaulting to `info`.

use cq_core::env::env_get_opt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LEVEL: &str = "info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = env_get_opt::<String>("CQ_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LEVEL.to_string());
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    })
}

/// Install the global fmt subscriber.
///
/// Poller threads are named `cq-poller-{i}`, so thread names are on.
/// Calling it again (or after another subscriber was installed) is a no-op.
///
/// ```ignore
/// cq_executor::logging::init();
/// tracing::info!("pool starting");
/// ```
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init();
}
