//! Alarm timers: make the host wait end by the next timer deadline

use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use hostloop_core::error::InitError;
use hostloop_core::{kdebug, kwarn, Timeout};

use super::TimerSubsystem;
use crate::config::AlarmKind;
use crate::sys::errno;

pub trait AlarmTimer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called before every wait with the timeout computed so far.
    fn prepare(&self, timers: &TimerSubsystem, timeout: &mut Timeout);

    /// Descriptor that becomes readable when the alarm fires
    fn fd(&self) -> Option<RawFd> {
        None
    }

    /// Consume a firing reported on [`fd`](Self::fd).
    fn acknowledge(&self) {}
}

/// Folds the earliest deadline into the wait timeout
#[derive(Debug, Default)]
pub struct DeadlineAlarm;

impl AlarmTimer for DeadlineAlarm {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn prepare(&self, timers: &TimerSubsystem, timeout: &mut Timeout) {
        timeout.tighten(timers.deadline_timeout());
    }
}

/// One-shot monotonic timerfd re-armed before every wait
pub struct TimerFdAlarm {
    tfd: TimerFd,
}

impl TimerFdAlarm {
    pub fn new() -> Result<Self, InitError> {
        let tfd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|e| InitError::AlarmTimer(e as i32))?;
        Ok(Self { tfd })
    }

    fn raw_fd(&self) -> RawFd {
        self.tfd.as_fd().as_raw_fd()
    }
}

impl AlarmTimer for TimerFdAlarm {
    fn name(&self) -> &'static str {
        "timerfd"
    }

    fn prepare(&self, timers: &TimerSubsystem, timeout: &mut Timeout) {
        let deadline = timers.deadline_timeout();
        let result = match deadline.as_duration() {
            // Already due: a zero expiration would disarm, so skip the wait
            Some(d) if d.is_zero() => {
                timeout.tighten(Timeout::ZERO);
                self.tfd.unset()
            }
            Some(d) => self
                .tfd
                .set(Expiration::OneShot(TimeSpec::from_duration(d)), TimerSetTimeFlags::empty()),
            None => self.tfd.unset(),
        };
        if let Err(e) = result {
            kwarn!("alarm: timerfd re-arm failed: {}", e);
            timeout.tighten(deadline);
        }
    }

    fn fd(&self) -> Option<RawFd> {
        Some(self.raw_fd())
    }

    fn acknowledge(&self) {
        let mut expirations: u64 = 0;
        // Safety: reading 8 bytes into a live u64
        let ret = unsafe {
            libc::read(
                self.raw_fd(),
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 && errno() != libc::EAGAIN {
            kwarn!("alarm: timerfd read failed, errno {}", errno());
        }
    }
}

impl std::fmt::Debug for TimerFdAlarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerFdAlarm").field("fd", &self.raw_fd()).finish()
    }
}

/// Create the configured alarm.
pub fn init_timer_alarm(kind: AlarmKind) -> Result<Arc<dyn AlarmTimer>, InitError> {
    let alarm: Arc<dyn AlarmTimer> = match kind {
        AlarmKind::Deadline => Arc::new(DeadlineAlarm),
        AlarmKind::TimerFd => Arc::new(TimerFdAlarm::new()?),
    };
    kdebug!("alarm: using {}", alarm.name());
    Ok(alarm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{init_clocks, ClockType};
    use std::time::Duration;

    #[test]
    fn test_deadline_alarm_tightens() {
        let timers = init_clocks();
        let t = timers.timer_new(ClockType::Realtime, || {});
        t.modify_in(Duration::from_millis(100));

        let mut timeout = Timeout::INFINITE;
        DeadlineAlarm.prepare(&timers, &mut timeout);
        assert!(timeout.as_millis().unwrap() <= 100);

        let mut short = Timeout::from_millis(5);
        DeadlineAlarm.prepare(&timers, &mut short);
        assert_eq!(short, Timeout::from_millis(5));
    }

    #[test]
    fn test_timerfd_alarm_wakes_descriptor() {
        let timers = init_clocks();
        let t = timers.timer_new(ClockType::Realtime, || {});
        t.modify_in(Duration::from_millis(10));

        let alarm = TimerFdAlarm::new().unwrap();
        let mut timeout = Timeout::INFINITE;
        alarm.prepare(&timers, &mut timeout);
        // The descriptor carries the deadline; the timeout is left alone
        assert!(timeout.is_infinite());

        let fd = alarm.fd().unwrap();
        let mut reqs = [crate::sys::PollRequest::new(fd, hostloop_core::IoCondition::IN)];
        assert_eq!(crate::sys::poll(&mut reqs, Timeout::from_millis(1000)), 1);
        alarm.acknowledge();
        assert_eq!(crate::sys::poll(&mut reqs, Timeout::ZERO), 0);
    }

    #[test]
    fn test_init_timer_alarm_kinds() {
        assert_eq!(init_timer_alarm(AlarmKind::Deadline).unwrap().name(), "deadline");
        let alarm = init_timer_alarm(AlarmKind::TimerFd).unwrap();
        assert_eq!(alarm.name(), "timerfd");
        assert!(alarm.fd().is_some());
    }
}
