//! Timers
//!
//! Three clocks ([`ClockType`]), one deadline-ordered list per clock.
//! The main loop runs due timers after every wait, and the alarm
//! ([`alarm::AlarmTimer`]) makes sure the wait ends in time for the next
//! deadline.
//!
//! # Example
//!
//! ```ignore
//! use hostloop_runtime::timer::{init_clocks, ClockType};
//!
//! let timers = init_clocks();
//! let t = timers.timer_new(ClockType::Realtime, || println!("tick"));
//! t.modify_in(std::time::Duration::from_millis(50));
//! ```

mod clock;
mod list;
pub mod alarm;

pub use clock::{Clock, ClockType};
pub use list::TimerListStats;
pub use alarm::{init_timer_alarm, AlarmTimer, DeadlineAlarm, TimerFdAlarm};

use std::sync::Arc;
use std::time::Duration;

use hostloop_core::Timeout;

use list::{Kick, TimerInner, TimerList};

/// An armable timer. Dropping it cancels any pending expiry.
pub struct Timer {
    inner: Arc<TimerInner>,
    list: Arc<TimerList>,
}

impl Timer {
    /// Arm for `expire_ns` on the timer's clock, replacing any previous
    /// expiry.
    pub fn modify(&self, expire_ns: i64) {
        self.list.arm(&self.inner, expire_ns);
    }

    /// Arm `delay` from now.
    pub fn modify_in(&self, delay: Duration) {
        let delta = delay.as_nanos().min(i64::MAX as u128) as i64;
        self.modify(self.now_ns().saturating_add(delta));
    }

    pub fn cancel(&self) {
        self.list.cancel(&self.inner);
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state().pending
    }

    /// Armed expiry, if pending
    pub fn expire_time(&self) -> Option<i64> {
        let st = self.inner.state();
        st.pending.then_some(st.expire_ns)
    }

    #[inline]
    pub fn clock(&self) -> ClockType {
        self.inner.clock
    }

    /// Current reading of the timer's clock
    pub fn now_ns(&self) -> i64 {
        self.list.clock().now_ns()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("clock", &self.clock())
            .field("expire_ns", &self.expire_time())
            .finish()
    }
}

/// Clocks and their timer lists
pub struct TimerSubsystem {
    lists: [Arc<TimerList>; 3],
    kick: Arc<Kick>,
}

/// Create the three clocks with empty timer lists.
pub fn init_clocks() -> Arc<TimerSubsystem> {
    let kick: Arc<Kick> = Arc::new(Kick::new());
    let list = |kind| Arc::new(TimerList::new(Arc::new(Clock::new(kind)), Arc::clone(&kick)));
    Arc::new(TimerSubsystem {
        lists: [
            list(ClockType::Realtime),
            list(ClockType::Virtual),
            list(ClockType::Host),
        ],
        kick: Arc::clone(&kick),
    })
}

impl TimerSubsystem {
    #[inline]
    fn list(&self, kind: ClockType) -> &Arc<TimerList> {
        &self.lists[kind.index()]
    }

    pub fn clock(&self, kind: ClockType) -> &Arc<Clock> {
        self.list(kind).clock()
    }

    pub fn now_ns(&self, kind: ClockType) -> i64 {
        self.clock(kind).now_ns()
    }

    /// Install the wakeup used when a new earliest deadline is armed.
    /// Only the first call takes effect.
    pub fn set_kick(&self, kick: impl Fn() + Send + Sync + 'static) {
        if self.kick.set(Box::new(kick)).is_err() {
            hostloop_core::kdebug!("timer: kick already installed");
        }
    }

    pub fn timer_new(&self, kind: ClockType, func: impl FnMut() + Send + 'static) -> Timer {
        Timer {
            inner: Arc::new(TimerInner::new(kind, Box::new(func))),
            list: Arc::clone(self.list(kind)),
        }
    }

    /// Run every due timer on every enabled clock. Returns the number fired.
    pub fn run_all_due_timers(&self) -> usize {
        ClockType::ALL.iter().map(|&k| self.list(k).run_due()).sum()
    }

    /// Earliest live deadline on `kind`
    pub fn next_deadline_ns(&self, kind: ClockType) -> Option<i64> {
        self.list(kind).next_deadline_ns()
    }

    /// Time until the earliest deadline over all enabled clocks
    pub fn deadline_timeout(&self) -> Timeout {
        let mut timeout = Timeout::INFINITE;
        for kind in ClockType::ALL {
            let list = self.list(kind);
            if !list.clock().is_enabled() {
                continue;
            }
            if let Some(deadline) = list.next_deadline_ns() {
                let delta = deadline.saturating_sub(list.clock().now_ns());
                let t = if delta <= 0 {
                    Timeout::ZERO
                } else {
                    Timeout::from_duration(Duration::from_nanos(delta as u64))
                };
                timeout.tighten(t);
            }
        }
        timeout
    }

    pub fn stats(&self, kind: ClockType) -> TimerListStats {
        self.list(kind).stats()
    }
}

impl std::fmt::Debug for TimerSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSubsystem")
            .field("rt", &self.stats(ClockType::Realtime))
            .field("vm", &self.stats(ClockType::Virtual))
            .field("host", &self.stats(ClockType::Host))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_due_timers_fire_in_deadline_order() {
        let timers = init_clocks();
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = timers.now_ns(ClockType::Realtime);

        let mk = |tag: &'static str| {
            let l = Arc::clone(&log);
            timers.timer_new(ClockType::Realtime, move || l.lock().unwrap().push(tag))
        };
        let late = mk("late");
        let early = mk("early");
        let tie = mk("tie");
        late.modify(now + 2_000);
        early.modify(now + 1_000);
        tie.modify(now + 2_000);

        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(timers.run_all_due_timers(), 3);
        assert_eq!(*log.lock().unwrap(), vec!["early", "late", "tie"]);
        assert!(!late.is_pending());
    }

    #[test]
    fn test_modify_replaces_and_cancel_discards() {
        let timers = init_clocks();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let t = timers.timer_new(ClockType::Realtime, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let now = t.now_ns();
        t.modify(now - 1);
        t.modify(now + 60_000_000_000);
        assert_eq!(timers.run_all_due_timers(), 0);
        assert_eq!(t.expire_time(), Some(now + 60_000_000_000));

        t.modify(now - 1);
        t.cancel();
        assert!(!t.is_pending());
        assert_eq!(timers.run_all_due_timers(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timers.deadline_timeout(), Timeout::INFINITE);
    }

    #[test]
    fn test_deadline_timeout_tracks_earliest() {
        let timers = init_clocks();
        let t = timers.timer_new(ClockType::Realtime, || {});
        assert!(timers.deadline_timeout().is_infinite());

        t.modify_in(Duration::from_millis(500));
        let ms = timers.deadline_timeout().as_millis().unwrap();
        assert!(ms > 400 && ms <= 500);

        t.modify(t.now_ns() - 10);
        assert!(timers.deadline_timeout().is_zero());
    }

    #[test]
    fn test_disabled_virtual_clock_holds_timers() {
        let timers = init_clocks();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let t = timers.timer_new(ClockType::Virtual, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        t.modify(t.now_ns());

        timers.clock(ClockType::Virtual).enable(false);
        assert_eq!(timers.run_all_due_timers(), 0);
        assert!(timers.deadline_timeout().is_infinite());

        timers.clock(ClockType::Virtual).enable(true);
        assert_eq!(timers.run_all_due_timers(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kick_on_new_earliest_deadline() {
        let timers = init_clocks();
        let kicks = Arc::new(AtomicUsize::new(0));
        let k = Arc::clone(&kicks);
        timers.set_kick(move || {
            k.fetch_add(1, Ordering::SeqCst);
        });

        let a = timers.timer_new(ClockType::Realtime, || {});
        let b = timers.timer_new(ClockType::Realtime, || {});
        a.modify_in(Duration::from_secs(10));
        b.modify_in(Duration::from_secs(20));
        assert_eq!(kicks.load(Ordering::SeqCst), 1);
        b.modify_in(Duration::from_secs(1));
        assert_eq!(kicks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_may_rearm_itself() {
        let timers = init_clocks();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));

        let h = Arc::clone(&hits);
        let s = Arc::clone(&slot);
        let t = timers.timer_new(ClockType::Realtime, move || {
            if h.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(t) = s.lock().unwrap().as_ref() {
                    t.modify_in(Duration::from_secs(60));
                }
            }
        });
        t.modify(t.now_ns());
        *slot.lock().unwrap() = Some(t);

        assert_eq!(timers.run_all_due_timers(), 1);
        assert!(slot.lock().unwrap().as_ref().unwrap().is_pending());
        slot.lock().unwrap().take();
    }
}
