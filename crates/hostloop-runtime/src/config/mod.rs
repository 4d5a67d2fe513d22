//! Main loop configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use hostloop_runtime::config::{MainLoopConfig, WaitBackendKind};
//!
//! let config = MainLoopConfig::from_env()
//!     .wait_backend(WaitBackendKind::HandlePoll)
//!     .max_wait_objects(16);
//! ```

pub mod defaults;

use hostloop_core::env::{env_get, env_get_bool, env_get_with};
use hostloop_core::error::InitError;

/// Which host wait implementation runs the blocking step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBackendKind {
    /// Descriptor sets + `select(2)`, framework sources folded into the sets
    Select,
    /// Handle polling: polling callbacks, wait objects and framework sources
    /// through `poll(2)`, followed by a zero-timeout `select(2)` sweep
    HandlePoll,
}

impl WaitBackendKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "select" | "posix" => Some(WaitBackendKind::Select),
            "poll" | "handle" | "handles" => Some(WaitBackendKind::HandlePoll),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WaitBackendKind::Select => "select",
            WaitBackendKind::HandlePoll => "poll",
        }
    }
}

/// How timer deadlines wake the blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    /// Fold the soonest deadline into the wait timeout
    Deadline,
    /// Arm a Linux timerfd and wait on it like any other descriptor
    TimerFd,
}

impl AlarmKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deadline" | "dynticks" => Some(AlarmKind::Deadline),
            "timerfd" => Some(AlarmKind::TimerFd),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AlarmKind::Deadline => "deadline",
            AlarmKind::TimerFd => "timerfd",
        }
    }
}

/// Main loop configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct MainLoopConfig {
    /// Capacity of the pending-source poll array
    pub poll_capacity: usize,
    /// Capacity of the wait-object table
    pub max_wait_objects: usize,
    /// Host wait implementation
    pub wait_backend: WaitBackendKind,
    /// Alarm timer implementation
    pub alarm: AlarmKind,
    /// Bridge SIGIO/SIGALRM/SIGBUS through a signalfd
    pub bridge_signals: bool,
    /// Idle bottom-half poll interval in milliseconds
    pub idle_bh_interval_ms: u32,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for MainLoopConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MainLoopConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `HOSTLOOP_POLL_CAPACITY` - Pending-source array capacity
    /// - `HOSTLOOP_MAX_WAIT_OBJECTS` - Wait-object table capacity
    /// - `HOSTLOOP_WAIT_BACKEND` - `select` or `poll`
    /// - `HOSTLOOP_ALARM` - `deadline` or `timerfd`
    /// - `HOSTLOOP_BRIDGE_SIGNALS` - Bridge signals (0/1)
    /// - `HOSTLOOP_IDLE_BH_INTERVAL_MS` - Idle bottom-half interval
    /// - `HOSTLOOP_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            poll_capacity: env_get("HOSTLOOP_POLL_CAPACITY", defaults::POLL_CAPACITY),
            max_wait_objects: env_get("HOSTLOOP_MAX_WAIT_OBJECTS", defaults::MAX_WAIT_OBJECTS),
            wait_backend: env_get_with(
                "HOSTLOOP_WAIT_BACKEND",
                defaults::WAIT_BACKEND,
                WaitBackendKind::parse,
            ),
            alarm: env_get_with("HOSTLOOP_ALARM", defaults::ALARM, AlarmKind::parse),
            bridge_signals: env_get_bool("HOSTLOOP_BRIDGE_SIGNALS", defaults::BRIDGE_SIGNALS),
            idle_bh_interval_ms: env_get(
                "HOSTLOOP_IDLE_BH_INTERVAL_MS",
                defaults::IDLE_BH_INTERVAL_MS,
            ),
            debug_logging: env_get_bool("HOSTLOOP_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for tests.
    pub fn new() -> Self {
        Self {
            poll_capacity: defaults::POLL_CAPACITY,
            max_wait_objects: defaults::MAX_WAIT_OBJECTS,
            wait_backend: defaults::WAIT_BACKEND,
            alarm: defaults::ALARM,
            bridge_signals: defaults::BRIDGE_SIGNALS,
            idle_bh_interval_ms: defaults::IDLE_BH_INTERVAL_MS,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn poll_capacity(mut self, n: usize) -> Self {
        self.poll_capacity = n;
        self
    }

    pub fn max_wait_objects(mut self, n: usize) -> Self {
        self.max_wait_objects = n;
        self
    }

    pub fn wait_backend(mut self, kind: WaitBackendKind) -> Self {
        self.wait_backend = kind;
        self
    }

    pub fn alarm(mut self, kind: AlarmKind) -> Self {
        self.alarm = kind;
        self
    }

    pub fn bridge_signals(mut self, enable: bool) -> Self {
        self.bridge_signals = enable;
        self
    }

    pub fn idle_bh_interval_ms(mut self, ms: u32) -> Self {
        self.idle_bh_interval_ms = ms;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.poll_capacity == 0 {
            return Err(InitError::InvalidConfig("poll_capacity must be > 0"));
        }
        if self.max_wait_objects == 0 {
            return Err(InitError::InvalidConfig("max_wait_objects must be > 0"));
        }
        if self.max_wait_objects >= self.poll_capacity {
            return Err(InitError::InvalidConfig(
                "max_wait_objects must be < poll_capacity",
            ));
        }
        if self.idle_bh_interval_ms == 0 {
            return Err(InitError::InvalidConfig("idle_bh_interval_ms must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("hostloop configuration:");
        eprintln!("  poll_capacity:        {}", self.poll_capacity);
        eprintln!("  max_wait_objects:     {}", self.max_wait_objects);
        eprintln!("  wait_backend:         {}", self.wait_backend.name());
        eprintln!("  alarm:                {}", self.alarm.name());
        eprintln!("  bridge_signals:       {}", self.bridge_signals);
        eprintln!("  idle_bh_interval_ms:  {}", self.idle_bh_interval_ms);
        eprintln!("  debug_logging:        {}", self.debug_logging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MainLoopConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.wait_backend, WaitBackendKind::Select);
        assert_eq!(config.alarm, AlarmKind::Deadline);
    }

    #[test]
    fn test_builder() {
        let config = MainLoopConfig::new()
            .wait_backend(WaitBackendKind::HandlePoll)
            .max_wait_objects(8)
            .bridge_signals(false);

        assert_eq!(config.wait_backend, WaitBackendKind::HandlePoll);
        assert_eq!(config.max_wait_objects, 8);
        assert!(!config.bridge_signals);
    }

    #[test]
    fn test_validation() {
        assert!(MainLoopConfig::new().poll_capacity(0).validate().is_err());
        assert!(MainLoopConfig::new().max_wait_objects(0).validate().is_err());
        assert!(MainLoopConfig::new()
            .poll_capacity(16)
            .max_wait_objects(16)
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!(WaitBackendKind::parse("POLL"), Some(WaitBackendKind::HandlePoll));
        assert_eq!(WaitBackendKind::parse("epoll"), None);
        assert_eq!(AlarmKind::parse("timerfd"), Some(AlarmKind::TimerFd));
        assert_eq!(AlarmKind::parse("dynticks"), Some(AlarmKind::Deadline));
    }
}
