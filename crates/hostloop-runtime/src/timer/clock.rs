//! Clock sources for timers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Which clock a timer is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockType {
    /// Monotonic host time; runs even while the guest is stopped
    Realtime,
    /// Guest time; frozen while disabled
    Virtual,
    /// Wall-clock time; may jump
    Host,
}

impl ClockType {
    /// Order in which due timers are run
    pub const ALL: [ClockType; 3] = [ClockType::Virtual, ClockType::Realtime, ClockType::Host];

    pub fn name(&self) -> &'static str {
        match self {
            ClockType::Realtime => "rt",
            ClockType::Virtual => "vm",
            ClockType::Host => "host",
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            ClockType::Realtime => 0,
            ClockType::Virtual => 1,
            ClockType::Host => 2,
        }
    }
}

struct Pause {
    /// Reading while disabled
    frozen_at: Option<i64>,
    /// Time spent disabled
    offset: i64,
}

pub struct Clock {
    kind: ClockType,
    base: Instant,
    enabled: AtomicBool,
    pause: Mutex<Pause>,
}

impl Clock {
    pub fn new(kind: ClockType) -> Self {
        Self {
            kind,
            base: Instant::now(),
            enabled: AtomicBool::new(true),
            pause: Mutex::new(Pause { frozen_at: None, offset: 0 }),
        }
    }

    #[inline]
    pub fn kind(&self) -> ClockType {
        self.kind
    }

    fn elapsed_ns(&self) -> i64 {
        self.base.elapsed().as_nanos().min(i64::MAX as u128) as i64
    }

    /// Current reading in nanoseconds
    pub fn now_ns(&self) -> i64 {
        match self.kind {
            ClockType::Realtime => self.elapsed_ns(),
            ClockType::Host => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
                .unwrap_or(0),
            ClockType::Virtual => {
                let pause = self.pause.lock().unwrap_or_else(|p| p.into_inner());
                match pause.frozen_at {
                    Some(t) => t,
                    None => self.elapsed_ns() - pause.offset,
                }
            }
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable timer processing on this clock. Disabling the
    /// virtual clock also stops it.
    pub fn enable(&self, enabled: bool) {
        if self.kind == ClockType::Virtual {
            let mut pause = self.pause.lock().unwrap_or_else(|p| p.into_inner());
            match (enabled, pause.frozen_at) {
                (false, None) => {
                    pause.frozen_at = Some(self.elapsed_ns() - pause.offset);
                }
                (true, Some(frozen)) => {
                    pause.offset = self.elapsed_ns() - frozen;
                    pause.frozen_at = None;
                }
                _ => {}
            }
        }
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
