//! Error types for the hostloop main loop

use core::fmt;

/// Result type for main loop operations
pub type LoopResult<T> = Result<T, LoopError>;

/// Errors that can occur while setting up or running the main loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// Startup could not complete (fatal to the process)
    InitializationFailure(InitError),

    /// A kernel interface broke its record contract (fatal)
    ProtocolViolation(ProtocolError),

    /// A bounded table is full; the table is left unchanged
    CapacityExceeded {
        what: &'static str,
        capacity: usize,
    },

    /// Descriptor cannot be waited on with `select(2)`
    DescriptorOutOfRange {
        fd: i32,
        limit: usize,
    },

    /// Main loop already initialized
    AlreadyInitialized,

    /// Main loop not initialized
    NotInitialized,

    /// Plain OS error with errno
    Os(i32),
}

impl LoopError {
    /// Negative errno-style status, as returned by `init_main_loop`.
    pub fn status(&self) -> i32 {
        let errno = match self {
            LoopError::InitializationFailure(e) => e.errno(),
            LoopError::ProtocolViolation(ProtocolError::SignalRead(e)) => *e,
            LoopError::ProtocolViolation(_) => libc_eio(),
            LoopError::CapacityExceeded { .. } => libc_enospc(),
            LoopError::DescriptorOutOfRange { .. } => libc_ebadf(),
            LoopError::AlreadyInitialized => libc_ebusy(),
            LoopError::NotInitialized => libc_enodev(),
            LoopError::Os(e) => *e,
        };
        -errno.abs().max(1)
    }

    /// True for the error classes that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LoopError::InitializationFailure(_) | LoopError::ProtocolViolation(_)
        )
    }
}

// errno values used for status mapping, kept local so this crate stays libc-free
const fn libc_eio() -> i32 { 5 }
const fn libc_ebadf() -> i32 { 9 }
const fn libc_ebusy() -> i32 { 16 }
const fn libc_enodev() -> i32 { 19 }
const fn libc_enospc() -> i32 { 28 }

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::InitializationFailure(e) => write!(f, "initialization failure: {}", e),
            LoopError::ProtocolViolation(e) => write!(f, "protocol violation: {}", e),
            LoopError::CapacityExceeded { what, capacity } => {
                write!(f, "{} is full (capacity {})", what, capacity)
            }
            LoopError::DescriptorOutOfRange { fd, limit } => {
                write!(f, "descriptor {} outside select() range 0..{}", fd, limit)
            }
            LoopError::AlreadyInitialized => write!(f, "main loop already initialized"),
            LoopError::NotInitialized => write!(f, "main loop not initialized"),
            LoopError::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for LoopError {}

/// Startup failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// Alarm timer could not be created or armed
    AlarmTimer(i32),

    /// signalfd creation failed
    SignalFd(i32),

    /// Blocking the bridged signals on the loop thread failed
    SignalMask(i32),

    /// eventfd creation for a notifier failed
    EventNotifier(i32),

    /// Configuration rejected by `validate()`
    InvalidConfig(&'static str),
}

impl InitError {
    fn errno(&self) -> i32 {
        match self {
            InitError::AlarmTimer(e)
            | InitError::SignalFd(e)
            | InitError::SignalMask(e)
            | InitError::EventNotifier(e) => *e,
            InitError::InvalidConfig(_) => 22, // EINVAL
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::AlarmTimer(e) => write!(f, "could not initialize alarm timer: errno {}", e),
            InitError::SignalFd(e) => write!(f, "failed to create signalfd: errno {}", e),
            InitError::SignalMask(e) => write!(f, "failed to block signals: errno {}", e),
            InitError::EventNotifier(e) => write!(f, "failed to create event notifier: errno {}", e),
            InitError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl From<InitError> for LoopError {
    fn from(e: InitError) -> Self {
        LoopError::InitializationFailure(e)
    }
}

/// Kernel record-contract violations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A signalfd read returned a partial record
    ShortSignalRead { got: isize, expected: usize },

    /// A signalfd read failed with something other than EAGAIN/EINTR
    SignalRead(i32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ShortSignalRead { got, expected } => {
                write!(f, "read from sigfd returned {} (expected {})", got, expected)
            }
            ProtocolError::SignalRead(e) => write!(f, "read from sigfd failed: errno {}", e),
        }
    }
}

impl From<ProtocolError> for LoopError {
    fn from(e: ProtocolError) -> Self {
        LoopError::ProtocolViolation(e)
    }
}

/// Log a fatal error and abort the process.
///
/// Used for invariants whose violation leaves the loop in an unknown state.
#[cold]
pub fn fatal(err: &LoopError) -> ! {
    crate::kerror!("fatal: {}", err);
    std::process::abort()
}
