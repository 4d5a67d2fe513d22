//! # hostloop-core
//!
//! Core types for the hostloop main loop.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All descriptor, signal and wait handling lives in `hostloop-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error types and fatal-path helpers
//! - `timeout` - Millisecond wait bound with "infinite" saturation
//! - `condition` - Readiness interest/result masks
//! - `lock` - The global execution lock and its scoped-unlock guard
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod error;
pub mod timeout;
pub mod condition;
pub mod lock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use error::{LoopError, LoopResult, InitError, ProtocolError};
pub use timeout::{Timeout, effective_timeout};
pub use condition::IoCondition;
pub use lock::{BigLock, BigLockGuard};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants shared across the loop
pub mod constants {
    /// Default capacity of the pending-source poll array.
    ///
    /// Must exceed any realistic number of pending sources; overflow is
    /// treated as a broken invariant, not a runtime condition.
    pub const DEFAULT_POLL_CAPACITY: usize = 1024 * 2;

    /// Default capacity of the wait-object table (MAXIMUM_WAIT_OBJECTS)
    pub const DEFAULT_MAX_WAIT_OBJECTS: usize = 64;

    /// Priority of the default event source (lower runs first)
    pub const PRIORITY_DEFAULT: i32 = 0;

    /// Priority used by idle sources
    pub const PRIORITY_DEFAULT_IDLE: i32 = 200;

    /// Sentinel for "no source is ready yet" in the priority ceiling
    pub const PRIORITY_NONE: i32 = i32::MAX;
}
