//! Stock sources: periodic timeouts and idle callbacks

use std::time::{Duration, Instant};

use super::EventSource;

/// Callback returning whether the source stays attached
pub type SourceFunc = Box<dyn FnMut() -> bool + Send>;

/// Fires every `interval`, measured from the end of the previous dispatch
pub struct TimeoutSource {
    interval: Duration,
    deadline: Instant,
    func: SourceFunc,
}

impl TimeoutSource {
    pub fn new(interval: Duration, func: impl FnMut() -> bool + Send + 'static) -> Self {
        Self {
            interval,
            deadline: Instant::now() + interval,
            func: Box::new(func),
        }
    }

    fn remaining_ms(&self, now: Instant) -> i32 {
        let left = self.deadline.saturating_duration_since(now);
        let ms = left.as_nanos().div_ceil(1_000_000);
        ms.min(i32::MAX as u128) as i32
    }
}

impl EventSource for TimeoutSource {
    fn prepare(&mut self, timeout_ms: &mut i32) -> bool {
        let remaining = self.remaining_ms(Instant::now());
        *timeout_ms = remaining;
        remaining == 0
    }

    fn check(&mut self, _fds: &[crate::sys::PollRequest]) -> bool {
        Instant::now() >= self.deadline
    }

    fn dispatch(&mut self) -> bool {
        let keep = (self.func)();
        self.deadline = Instant::now() + self.interval;
        keep
    }

    fn name(&self) -> &'static str {
        "timeout"
    }
}

/// Ready on every iteration; attach at an idle priority
pub struct IdleSource {
    func: SourceFunc,
}

impl IdleSource {
    pub fn new(func: impl FnMut() -> bool + Send + 'static) -> Self {
        Self { func: Box::new(func) }
    }
}

impl EventSource for IdleSource {
    fn prepare(&mut self, timeout_ms: &mut i32) -> bool {
        *timeout_ms = 0;
        true
    }

    fn dispatch(&mut self) -> bool {
        (self.func)()
    }

    fn name(&self) -> &'static str {
        "idle"
    }
}
