//! # hostloop - emulator main loop
//!
//! One process-wide dispatch loop for everything the host side of an
//! emulator waits on: device descriptors, a user-mode network stack,
//! timers, bridged signals, event sources and asynchronous I/O completions.
//!
//! ## Quick Start
//!
//! ```ignore
//! use hostloop::{init_main_loop, iothread_lock, main_loop_wait, notify_event};
//!
//! fn main() {
//!     if init_main_loop() < 0 {
//!         std::process::exit(1);
//!     }
//!
//!     let mut guard = iothread_lock();
//!     loop {
//!         main_loop_wait(&mut guard, false);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │           main_loop_wait (loop thread, lock held)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌─────────────┐     ┌───────────┐
//!    │ Network / │      │ Event-source│     │  Timers   │
//!    │ device fds│      │  framework  │     │ (alarm)   │
//!    └───────────┘      └─────────────┘     └───────────┘
//!          │                   │
//!          ▼                   ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │        Host wait: select(2) or handle polling           │
//!    │              execution lock released                    │
//!    └─────────────────────────────────────────────────────────┘
//!          ▲                   ▲
//!    signalfd (SIGIO,     eventfd (notify_event,
//!    SIGALRM, SIGBUS)     bottom halves)
//! ```
//!
//! Registration functions may be called from any thread once the loop is
//! initialized. `main_loop_wait` must only run on one thread at a time and
//! never from inside one of its own callbacks.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError};

// Re-export core types
pub use hostloop_core::{
    BigLock,
    BigLockGuard,
    IoCondition,
    LoopError,
    LoopResult,
    InitError,
    ProtocolError,
    Timeout,
};

// Re-export kprint macros for debug logging
pub use hostloop_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use hostloop_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled, set_time_enabled};

// Re-export env utilities
pub use hostloop_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use hostloop_runtime::{
    AioContext,
    AlarmKind,
    BottomHalf,
    ClockType,
    DescriptorSet,
    EventNotifier,
    EventSource,
    MainLoop,
    MainLoopConfig,
    MainLoopShared,
    NetworkStack,
    PollingToken,
    SignalHandler,
    SignalInfo,
    SourceId,
    Timer,
    WaitBackendKind,
};
pub use hostloop_runtime::aio::{AioFlushHandler, EventNotifierFlushHandler, EventNotifierHandler, IoHandler};
pub use hostloop_runtime::iohandler::CanReadHandler;
pub use hostloop_runtime::wait::{PollingFunc, WaitObjectFunc};
pub use hostloop_runtime::signal::{Signal, SIG_IPI};

use hostloop_runtime::iohandler::DeviceIoMultiplexer as _;

struct Global {
    shared: Arc<MainLoopShared>,
    driver: Mutex<MainLoop>,
    /// Network stack change requested while an iteration was running
    pending_net: Mutex<Option<Option<Box<dyn NetworkStack>>>>,
}

static IOTHREAD_LOCK: OnceLock<Arc<BigLock>> = OnceLock::new();
static MAIN_LOOP: OnceLock<Global> = OnceLock::new();

thread_local! {
    static IN_WAIT: Cell<bool> = const { Cell::new(false) };
}

fn big_lock() -> &'static Arc<BigLock> {
    IOTHREAD_LOCK.get_or_init(|| Arc::new(BigLock::new()))
}

fn shared() -> LoopResult<&'static Arc<MainLoopShared>> {
    MAIN_LOOP.get().map(|g| &g.shared).ok_or(LoopError::NotInitialized)
}

fn driver(g: &'static Global) -> MutexGuard<'static, MainLoop> {
    assert!(
        !IN_WAIT.with(Cell::get),
        "main loop re-entered from one of its own callbacks"
    );
    g.driver.lock().unwrap_or_else(|p| p.into_inner())
}

/// Acquire the global execution lock.
pub fn iothread_lock() -> BigLockGuard<'static> {
    big_lock().lock()
}

/// The global execution lock itself
pub fn iothread_lock_ref() -> &'static BigLock {
    big_lock()
}

/// Initialize the main loop from environment configuration.
///
/// Returns 0 on success or a negative status. Failure to set up the alarm
/// timer terminates the process.
pub fn init_main_loop() -> i32 {
    init_main_loop_with(MainLoopConfig::from_env())
}

/// Initialize the main loop with an explicit configuration.
pub fn init_main_loop_with(config: MainLoopConfig) -> i32 {
    match try_init_main_loop(config) {
        Ok(()) => 0,
        Err(LoopError::InitializationFailure(InitError::AlarmTimer(e))) => {
            kerror!("could not initialize alarm timer (errno {})", e);
            std::process::exit(1);
        }
        Err(e) => {
            kerror!("init_main_loop: {}", e);
            e.status()
        }
    }
}

/// Initialize the main loop, reporting every failure as an error.
///
/// The calling thread becomes the loop thread: bridged signals are blocked
/// on it.
pub fn try_init_main_loop(config: MainLoopConfig) -> LoopResult<()> {
    if MAIN_LOOP.get().is_some() {
        return Err(LoopError::AlreadyInitialized);
    }
    let main_loop = MainLoop::new(config, Arc::clone(big_lock()))?;
    let global = Global {
        shared: Arc::clone(main_loop.shared()),
        driver: Mutex::new(main_loop),
        pending_net: Mutex::new(None),
    };
    MAIN_LOOP.set(global).map_err(|_| LoopError::AlreadyInitialized)
}

pub fn is_initialized() -> bool {
    MAIN_LOOP.get().is_some()
}

/// Run one main loop iteration. `guard` must hold the execution lock; it is
/// released while the iteration blocks.
///
/// # Panics
///
/// Before [`init_main_loop`], or when called from inside a loop callback.
pub fn main_loop_wait(guard: &mut BigLockGuard<'_>, nonblocking: bool) -> i32 {
    let Some(g) = MAIN_LOOP.get() else {
        panic!("main_loop_wait called before init_main_loop");
    };
    let mut main_loop = driver(g);
    let pending = g.pending_net.lock().unwrap_or_else(|p| p.into_inner()).take();
    if let Some(net) = pending {
        main_loop.set_network_stack(net);
    }

    struct Leave;
    impl Drop for Leave {
        fn drop(&mut self) {
            IN_WAIT.with(|w| w.set(false));
        }
    }
    IN_WAIT.with(|w| w.set(true));
    let _leave = Leave;

    main_loop.wait(guard, nonblocking)
}

/// Wake the main loop from any thread. A no-op before initialization.
pub fn notify_event() {
    if let Ok(shared) = shared() {
        shared.notify();
    }
}

/// Registration surfaces, for callers that keep a handle
pub fn main_loop_shared() -> Option<Arc<MainLoopShared>> {
    shared().ok().map(Arc::clone)
}

/// The process-wide asynchronous I/O context
pub fn get_aio_context() -> Option<Arc<AioContext>> {
    shared().ok().map(|s| Arc::clone(&s.aio))
}

pub fn bh_new(func: impl FnMut() + Send + 'static) -> LoopResult<BottomHalf> {
    Ok(shared()?.aio.bh_new(func))
}

/// Make progress on outstanding asynchronous I/O, blocking while requests
/// are in flight. False before initialization.
pub fn aio_wait() -> bool {
    match shared() {
        Ok(s) => s.aio.poll(true),
        Err(_) => false,
    }
}

pub fn aio_set_fd_handler(
    fd: RawFd,
    read: Option<IoHandler>,
    write: Option<IoHandler>,
    flush: Option<AioFlushHandler>,
) -> LoopResult<()> {
    shared()?.aio.set_fd_handler(fd, read, write, flush);
    Ok(())
}

pub fn aio_set_event_notifier(
    notifier: &Arc<EventNotifier>,
    read: Option<EventNotifierHandler>,
    flush: Option<EventNotifierFlushHandler>,
) -> LoopResult<()> {
    shared()?.aio.set_event_notifier(notifier, read, flush);
    Ok(())
}

/// Register device I/O callbacks for `fd`; no read and no write removes.
pub fn set_fd_handler2(
    fd: RawFd,
    can_read: Option<CanReadHandler>,
    read: Option<IoHandler>,
    write: Option<IoHandler>,
) -> LoopResult<()> {
    shared()?.iohandlers.set_fd_handler2(fd, can_read, read, write)
}

pub fn set_fd_handler(fd: RawFd, read: Option<IoHandler>, write: Option<IoHandler>) -> LoopResult<()> {
    set_fd_handler2(fd, None, read, write)
}

/// Add interest for every registered device descriptor to `sets`
pub fn fill_device_descriptors(sets: &mut DescriptorSet) -> LoopResult<()> {
    shared()?.iohandlers.fill_descriptors(sets);
    Ok(())
}

pub fn timer_new(clock: ClockType, func: impl FnMut() + Send + 'static) -> LoopResult<Timer> {
    Ok(shared()?.timers.timer_new(clock, func))
}

/// Current reading of `clock` in nanoseconds
pub fn clock_ns(clock: ClockType) -> LoopResult<i64> {
    Ok(shared()?.timers.now_ns(clock))
}

/// Pause or resume the virtual clock
pub fn set_vm_clock_enabled(enabled: bool) -> LoopResult<()> {
    shared()?.timers.clock(ClockType::Virtual).enable(enabled);
    Ok(())
}

pub fn add_polling_cb(func: PollingFunc) -> LoopResult<PollingToken> {
    Ok(shared()?.handles.polling.add(func))
}

/// Remove a polling callback. Unknown tokens are a no-op.
pub fn del_polling_cb(token: PollingToken) -> bool {
    shared().map(|s| s.handles.polling.remove(token)).unwrap_or(false)
}

/// Add a wait object. Fails with [`LoopError::CapacityExceeded`] when the
/// table is full.
pub fn add_wait_object(handle: RawFd, func: Option<WaitObjectFunc>) -> LoopResult<()> {
    shared()?.handles.wait_objects.add(handle, func)
}

/// Remove the first wait object for `handle`. Unknown handles are a no-op.
pub fn del_wait_object(handle: RawFd) -> bool {
    shared().map(|s| s.handles.wait_objects.remove(handle)).unwrap_or(false)
}

/// Wake the handle-polling wait whenever `fd` has input.
pub fn fd_register(fd: RawFd) -> LoopResult<()> {
    shared()?.handles.fd_register(fd);
    Ok(())
}

/// Stop waking on `fd`. Returns false if it was never registered.
pub fn fd_unregister(fd: RawFd) -> bool {
    shared().map(|s| s.handles.fd_unregister(fd)).unwrap_or(false)
}

/// Install `handler` for a bridged signal. Returns true if one was replaced.
pub fn set_signal_handler(signal: Signal, handler: SignalHandler) -> LoopResult<bool> {
    Ok(shared()?.signal_handlers.set(signal, handler))
}

/// Attach an event source to the loop's framework
pub fn source_attach(source: Box<dyn EventSource>, priority: i32) -> LoopResult<SourceId> {
    Ok(shared()?.sources.attach(source, priority))
}

pub fn source_remove(id: SourceId) -> bool {
    shared().map(|s| s.sources.remove(id)).unwrap_or(false)
}

/// Install or remove the network stack collaborator.
///
/// While an iteration is running the change is deferred to the start of
/// the next one.
pub fn set_network_stack(net: Option<Box<dyn NetworkStack>>) -> LoopResult<()> {
    let g = MAIN_LOOP.get().ok_or(LoopError::NotInitialized)?;
    let mut pending = g.pending_net.lock().unwrap_or_else(|p| p.into_inner());
    match g.driver.try_lock() {
        Ok(mut main_loop) => {
            pending.take();
            main_loop.set_network_stack(net);
        }
        Err(TryLockError::Poisoned(p)) => {
            pending.take();
            p.into_inner().set_network_stack(net);
        }
        Err(TryLockError::WouldBlock) => *pending = Some(net),
    }
    Ok(())
}
