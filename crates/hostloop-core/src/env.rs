//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `MainLoopConfig::from_env()`.
//!
//! ```ignore
//! use hostloop_core::env::{env_get, env_get_bool, env_get_with};
//!
//! let capacity: usize = env_get("HOSTLOOP_POLL_CAPACITY", 2048);
//! let bridge = env_get_bool("HOSTLOOP_BRIDGE_SIGNALS", true);
//! let backend = env_get_with("HOSTLOOP_WAIT_BACKEND", Backend::Select, Backend::parse);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable through a custom parser, or return default
///
/// For enum-valued settings that do not implement `FromStr`.
#[inline]
pub fn env_get_with<T, F>(key: &str, default: T, parse: F) -> T
where
    F: FnOnce(&str) -> Option<T>,
{
    std::env::var(key)
        .ok()
        .and_then(|v| parse(v.trim()))
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (case-insensitive) are true; "0", "false",
/// "no", "off" are false. Unset or anything else returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    env_get_with(key, default, |v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}
