//! # hostloop-runtime
//!
//! Platform-specific implementation of the hostloop main loop.
//!
//! This crate provides:
//! - Signal bridging (signalfd) into loop callbacks
//! - An event-source framework and its fusion with descriptor-set waits
//! - Two blocking wait strategies (`select(2)`, handle polling)
//! - Polling-callback and wait-object registries
//! - The asynchronous I/O context with bottom halves and event notifiers
//! - Timers over realtime, virtual and host clocks
//! - The main loop driver tying the above together

#![allow(dead_code)]

pub mod config;
pub mod fdset;
pub mod sys;
pub mod signal;
pub mod aio;
pub mod source;
pub mod iohandler;
pub mod timer;
pub mod wait;
pub mod main_loop;

// Re-exports
pub use config::{AlarmKind, MainLoopConfig, WaitBackendKind};
pub use fdset::{DescriptorSet, FdSet, FD_SETSIZE};
pub use sys::PollRequest;
pub use signal::{SignalBridge, SignalHandler, SignalHandlers, SignalInfo, SIG_IPI};
pub use aio::{AioContext, BottomHalf, EventNotifier};
pub use source::{EventSource, EventSourceFusion, SourceContext, SourceId};
pub use iohandler::{CanReadHandler, DeviceIoMultiplexer, IoHandlerRegistry};
pub use timer::{init_clocks, ClockType, Timer, TimerSubsystem};
pub use wait::{HandleRegistry, HostWait, PollingToken, WaitObjectTable};
pub use main_loop::{MainLoop, MainLoopShared, NetworkStack};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("hostloop-runtime requires Linux (eventfd, signalfd, timerfd)");
    }
}
