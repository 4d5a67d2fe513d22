//! Compile-time defaults for `MainLoopConfig`

use hostloop_core::constants;

use super::{AlarmKind, WaitBackendKind};

/// Pending-source poll array capacity
pub const POLL_CAPACITY: usize = constants::DEFAULT_POLL_CAPACITY;

/// Wait-object table capacity
pub const MAX_WAIT_OBJECTS: usize = constants::DEFAULT_MAX_WAIT_OBJECTS;

/// Host wait implementation
pub const WAIT_BACKEND: WaitBackendKind = WaitBackendKind::Select;

/// Alarm timer implementation
pub const ALARM: AlarmKind = AlarmKind::Deadline;

/// Convert blocked signals into readiness on the loop thread
pub const BRIDGE_SIGNALS: bool = true;

/// How often idle bottom halves get a chance to run
pub const IDLE_BH_INTERVAL_MS: u32 = 10;

/// Extra diagnostics
pub const DEBUG_LOGGING: bool = false;
