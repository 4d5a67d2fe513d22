//! signalfd-based signal bridge
//!
//! At construction the bridge blocks the bridged signals plus [`SIG_IPI`] on
//! the calling thread (threads spawned afterwards inherit the mask) and
//! opens a non-blocking signalfd for the bridged set. [`SIG_IPI`] stays
//! blocked but is not bridged: it is reserved for directed wakeups that are
//! consumed elsewhere.
//!
//! Each time the descriptor is readable the bridge drains it, one
//! `signalfd_siginfo` record per read, and invokes the handler registered for
//! that signal. A record of the wrong size means the kernel and the process
//! disagree about the wire format; that is fatal.

use std::collections::HashMap;
use std::mem::{size_of, MaybeUninit};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

pub use nix::sys::signal::Signal;
use nix::sys::signal::SigSet;
use nix::sys::signalfd::{SfdFlags, SignalFd};

use hostloop_core::error::{InitError, ProtocolError};
use hostloop_core::{kdebug, kerror, LoopResult};

use crate::iohandler::IoHandlerRegistry;
use crate::sys::errno;

/// Signal reserved for directed inter-thread wakeups
pub const SIG_IPI: Signal = Signal::SIGUSR1;

/// Signals delivered through the bridge
pub const BRIDGED_SIGNALS: [Signal; 3] = [Signal::SIGIO, Signal::SIGALRM, Signal::SIGBUS];

/// One record read from the signalfd
#[derive(Clone, Copy)]
pub struct SignalInfo {
    raw: libc::signalfd_siginfo,
}

impl SignalInfo {
    pub fn from_raw(raw: libc::signalfd_siginfo) -> Self {
        Self { raw }
    }

    /// Build a record for `signal` with every other field zero
    pub fn for_signal(signal: Signal) -> Self {
        // Safety: signalfd_siginfo is plain old data
        let mut raw: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
        raw.ssi_signo = signal as i32 as u32;
        Self { raw }
    }

    #[inline]
    pub fn signo(&self) -> i32 {
        self.raw.ssi_signo as i32
    }

    pub fn signal(&self) -> Option<Signal> {
        Signal::try_from(self.signo()).ok()
    }

    #[inline]
    pub fn code(&self) -> i32 {
        self.raw.ssi_code
    }

    #[inline]
    pub fn errno(&self) -> i32 {
        self.raw.ssi_errno
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.raw.ssi_pid
    }

    #[inline]
    pub fn uid(&self) -> u32 {
        self.raw.ssi_uid
    }

    /// Descriptor for SIGIO
    #[inline]
    pub fn fd(&self) -> i32 {
        self.raw.ssi_fd
    }

    /// Band event for SIGIO
    #[inline]
    pub fn band(&self) -> u32 {
        self.raw.ssi_band
    }

    /// Faulting address for SIGBUS
    #[inline]
    pub fn addr(&self) -> u64 {
        self.raw.ssi_addr
    }

    #[inline]
    pub fn raw(&self) -> &libc::signalfd_siginfo {
        &self.raw
    }
}

impl std::fmt::Debug for SignalInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalInfo")
            .field("signo", &self.signo())
            .field("code", &self.code())
            .field("pid", &self.pid())
            .field("fd", &self.fd())
            .finish()
    }
}

/// A handler invoked on the loop thread for a bridged signal
pub enum SignalHandler {
    /// Receives the signal only
    Basic(Box<dyn FnMut(Signal) + Send>),
    /// Receives the full record
    Extended(Box<dyn FnMut(Signal, &SignalInfo) + Send>),
}

impl SignalHandler {
    pub fn basic(f: impl FnMut(Signal) + Send + 'static) -> Self {
        SignalHandler::Basic(Box::new(f))
    }

    pub fn extended(f: impl FnMut(Signal, &SignalInfo) + Send + 'static) -> Self {
        SignalHandler::Extended(Box::new(f))
    }

    fn invoke(&mut self, signal: Signal, info: &SignalInfo) {
        match self {
            SignalHandler::Basic(f) => f(signal),
            SignalHandler::Extended(f) => f(signal, info),
        }
    }
}

impl std::fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalHandler::Basic(_) => f.write_str("SignalHandler::Basic"),
            SignalHandler::Extended(_) => f.write_str("SignalHandler::Extended"),
        }
    }
}

/// Handlers keyed by signal
#[derive(Default)]
pub struct SignalHandlers {
    map: Mutex<HashMap<Signal, Arc<Mutex<SignalHandler>>>>,
}

impl SignalHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Signal, Arc<Mutex<SignalHandler>>>> {
        self.map.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Install `handler` for `signal`, returning true if one was replaced.
    pub fn set(&self, signal: Signal, handler: SignalHandler) -> bool {
        self.map().insert(signal, Arc::new(Mutex::new(handler))).is_some()
    }

    pub fn remove(&self, signal: Signal) -> bool {
        self.map().remove(&signal).is_some()
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.map().contains_key(&signal)
    }

    /// Invoke the handler for `info`. Returns false if none is registered.
    pub fn deliver(&self, info: &SignalInfo) -> bool {
        let Some(signal) = info.signal() else {
            kdebug!("signal: unknown signo {}", info.signo());
            return false;
        };
        // Release the map before running so handlers may re-register
        let handler = self.map().get(&signal).cloned();
        match handler {
            Some(h) => {
                h.lock().unwrap_or_else(|p| p.into_inner()).invoke(signal, info);
                true
            }
            None => {
                kdebug!("signal: no handler for {:?}", signal);
                false
            }
        }
    }
}

impl std::fmt::Debug for SignalHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<Signal> = self.map().keys().copied().collect();
        f.debug_struct("SignalHandlers").field("signals", &keys).finish()
    }
}

/// Read every pending record from `fd` and deliver it.
/// Returns the number of records read.
pub fn drain_signalfd(fd: RawFd, handlers: &SignalHandlers) -> Result<usize, ProtocolError> {
    let expected = size_of::<libc::signalfd_siginfo>();
    let mut count = 0;

    loop {
        let mut raw = MaybeUninit::<libc::signalfd_siginfo>::zeroed();
        let len = loop {
            // Safety: raw has room for exactly `expected` bytes
            let r = unsafe { libc::read(fd, raw.as_mut_ptr() as *mut libc::c_void, expected) };
            if r < 0 && errno() == libc::EINTR {
                continue;
            }
            break r;
        };

        if len < 0 {
            let e = errno();
            if e == libc::EAGAIN {
                return Ok(count);
            }
            return Err(ProtocolError::SignalRead(e));
        }
        if len as usize != expected {
            return Err(ProtocolError::ShortSignalRead { got: len, expected });
        }

        // Safety: the kernel filled the whole record
        let info = SignalInfo::from_raw(unsafe { raw.assume_init() });
        handlers.deliver(&info);
        count += 1;
    }
}

/// Bridges asynchronous signals into the main loop
pub struct SignalBridge {
    sfd: SignalFd,
    handlers: Arc<SignalHandlers>,
    registry: Mutex<Option<Arc<IoHandlerRegistry>>>,
}

impl SignalBridge {
    /// Signals routed through the descriptor
    pub fn bridged_set() -> SigSet {
        let mut set = SigSet::empty();
        for sig in BRIDGED_SIGNALS {
            set.add(sig);
        }
        set
    }

    /// Signals blocked on the calling thread
    pub fn blocked_set() -> SigSet {
        let mut set = Self::bridged_set();
        set.add(SIG_IPI);
        set
    }

    /// Block the signals on the calling thread and open the descriptor.
    pub fn new(handlers: Arc<SignalHandlers>) -> Result<Self, InitError> {
        Self::blocked_set()
            .thread_block()
            .map_err(|e| InitError::SignalMask(e as i32))?;

        let sfd = SignalFd::with_flags(
            &Self::bridged_set(),
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )
        .map_err(|e| InitError::SignalFd(e as i32))?;

        kdebug!("signal: bridge on fd {}", sfd.as_fd().as_raw_fd());
        Ok(Self {
            sfd,
            handlers,
            registry: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.sfd.as_fd().as_raw_fd()
    }

    #[inline]
    pub fn handlers(&self) -> &Arc<SignalHandlers> {
        &self.handlers
    }

    /// Service the descriptor from `registry`. A protocol violation while
    /// draining aborts the process.
    pub fn register(&self, registry: &Arc<IoHandlerRegistry>) -> LoopResult<()> {
        let fd = self.fd();
        let handlers = Arc::clone(&self.handlers);
        registry.set_fd_handler(
            fd,
            Some(Box::new(move || {
                if let Err(e) = drain_signalfd(fd, &handlers) {
                    kerror!("signal: reading signalfd {} failed: {}", fd, e);
                    hostloop_core::error::fatal(&e.into());
                }
            })),
            None,
        )?;
        *self.registry.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(registry));
        Ok(())
    }

    /// Drain the descriptor now.
    pub fn drain(&self) -> Result<usize, ProtocolError> {
        drain_signalfd(self.fd(), &self.handlers)
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        let registry = self.registry.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(registry) = registry {
            registry.remove(self.fd());
        }
    }
}

impl std::fmt::Debug for SignalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBridge")
            .field("fd", &self.fd())
            .field("handlers", &self.handlers)
            .finish()
    }
}
