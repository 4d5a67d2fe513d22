//! Wait timeout in milliseconds
//!
//! A single best-effort upper bound on how long one iteration may block.
//! Every contributor can only shrink it; `u32::MAX` means "no deadline".
//! Never carried across iterations.

use core::fmt;
use std::time::Duration;

/// Upper bound on one blocking wait, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeout(u32);

impl Timeout {
    /// Block with no deadline
    pub const INFINITE: Timeout = Timeout(u32::MAX);

    /// Do not block at all
    pub const ZERO: Timeout = Timeout(0);

    /// Build from milliseconds; `u32::MAX` is infinite
    #[inline]
    pub const fn from_millis(ms: u32) -> Self {
        Timeout(ms)
    }

    /// Build from a duration, rounding partial milliseconds up and
    /// saturating to infinite.
    pub fn from_duration(d: Duration) -> Self {
        let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
        Timeout(u32::try_from(ms).unwrap_or(u32::MAX))
    }

    /// Starting timeout for an iteration
    #[inline]
    pub const fn for_iteration(nonblocking: bool) -> Self {
        if nonblocking { Timeout::ZERO } else { Timeout::INFINITE }
    }

    #[inline]
    pub const fn is_infinite(&self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Milliseconds, `None` when infinite
    #[inline]
    pub const fn as_millis(&self) -> Option<u32> {
        if self.is_infinite() { None } else { Some(self.0) }
    }

    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Shrink to `other` if it is tighter
    #[inline]
    pub fn tighten(&mut self, other: Timeout) {
        if other.0 < self.0 {
            self.0 = other.0;
        }
    }

    /// Shrink to a framework-reported timeout.
    ///
    /// The event-source framework reports milliseconds as `i32`, with any
    /// negative value meaning it has no opinion.
    #[inline]
    pub fn tighten_framework(&mut self, framework_ms: i32) {
        if let Ok(ms) = u32::try_from(framework_ms) {
            self.tighten(Timeout(ms));
        }
    }

    /// Milliseconds for `poll(2)`-style waits: -1 is infinite
    #[inline]
    pub fn as_poll_millis(&self) -> i32 {
        match self.as_millis() {
            None => -1,
            Some(ms) => i32::try_from(ms).unwrap_or(i32::MAX),
        }
    }

    /// (seconds, microseconds) for `select(2)`; `None` is infinite
    #[inline]
    pub fn as_secs_micros(&self) -> Option<(u64, u32)> {
        self.as_millis()
            .map(|ms| (u64::from(ms / 1000), (ms % 1000) * 1000))
    }

    #[inline]
    pub fn as_duration(&self) -> Option<Duration> {
        self.as_millis().map(|ms| Duration::from_millis(u64::from(ms)))
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::INFINITE
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_millis() {
            None => write!(f, "inf"),
            Some(ms) => write!(f, "{}ms", ms),
        }
    }
}

/// Effective timeout for one wait: the caller's bound, tightened by the
/// framework's own timeout when it has one (non-negative).
#[inline]
pub fn effective_timeout(caller: Timeout, framework_ms: i32) -> Timeout {
    let mut t = caller;
    t.tighten_framework(framework_ms);
    t
}
