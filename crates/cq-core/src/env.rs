//! Environment variable helpers for `CQ_*` settings.
//!
//! ```ignore
//! use cq_core::env::{env_get, env_get_bool};
//!
//! let pool_size: usize = env_get("CQ_POOL_SIZE", 4);
//! let verbose = env_get_bool("CQ_VERBOSE", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`; unset or unparsable values yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only if `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true; any other set value is
/// false; unset yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
