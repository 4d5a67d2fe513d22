//! Per-clock timer list
//!
//! A min-heap of armed entries ordered by expiry, then arming order.
//!
//! # Cancellation
//!
//! Lazy: every `modify`/`cancel` bumps the timer's generation, and heap
//! entries carrying an older generation are discarded when they reach the
//! top. Re-arming never searches the heap.

use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError, Weak};

use super::clock::{Clock, ClockType};

/// Wakes the loop when the earliest deadline moves forward
pub(crate) type Kick = OnceLock<Box<dyn Fn() + Send + Sync>>;

pub(crate) struct TimerState {
    pub(crate) expire_ns: i64,
    pub(crate) generation: u64,
    pub(crate) pending: bool,
}

pub(crate) struct TimerInner {
    pub(crate) clock: ClockType,
    func: Mutex<Box<dyn FnMut() + Send>>,
    state: Mutex<TimerState>,
}

impl TimerInner {
    pub(crate) fn new(clock: ClockType, func: Box<dyn FnMut() + Send>) -> Self {
        Self {
            clock,
            func: Mutex::new(func),
            state: Mutex::new(TimerState { expire_ns: 0, generation: 0, pending: false }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn fire(&self) {
        match self.func.try_lock() {
            Ok(mut f) => (*f)(),
            Err(TryLockError::Poisoned(p)) => {
                let mut f = p.into_inner();
                (*f)()
            }
            Err(TryLockError::WouldBlock) => {
                hostloop_core::kwarn!("timer: callback re-entered, skipping");
            }
        }
    }
}

struct HeapEntry {
    expire_ns: i64,
    seq: u64,
    generation: u64,
    timer: Weak<TimerInner>,
}

impl HeapEntry {
    fn is_live(&self) -> bool {
        match self.timer.upgrade() {
            Some(t) => {
                let st = t.state();
                st.pending && st.generation == self.generation
            }
            None => false,
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expire_ns == other.expire_ns && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap; equal deadlines fire in arming order
        match other.expire_ns.cmp(&self.expire_ns) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

struct ListInner {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    total_armed: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl ListInner {
    // Pop stale entries until the top is live
    fn purge(&mut self) {
        while let Some(top) = self.heap.peek() {
            if top.is_live() {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Statistics snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerListStats {
    /// Heap entries, stale ones included
    pub queued: usize,
    pub total_armed: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

pub(crate) struct TimerList {
    clock: Arc<Clock>,
    inner: Mutex<ListInner>,
    kick: Arc<Kick>,
}

impl TimerList {
    pub(crate) fn new(clock: Arc<Clock>, kick: Arc<Kick>) -> Self {
        Self {
            clock,
            inner: Mutex::new(ListInner {
                heap: BinaryHeap::with_capacity(64),
                next_seq: 0,
                total_armed: 0,
                total_fired: 0,
                total_cancelled: 0,
            }),
            kick,
        }
    }

    fn inner(&self) -> MutexGuard<'_, ListInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[inline]
    pub(crate) fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub(crate) fn arm(&self, timer: &Arc<TimerInner>, expire_ns: i64) {
        let generation = {
            let mut st = timer.state();
            st.generation += 1;
            st.pending = true;
            st.expire_ns = expire_ns;
            st.generation
        };

        let is_head = {
            let mut inner = self.inner();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.total_armed += 1;
            inner.heap.push(HeapEntry {
                expire_ns,
                seq,
                generation,
                timer: Arc::downgrade(timer),
            });
            inner.purge();
            inner.heap.peek().map(|e| e.seq) == Some(seq)
        };

        if is_head {
            if let Some(kick) = self.kick.get() {
                kick();
            }
        }
    }

    pub(crate) fn cancel(&self, timer: &TimerInner) {
        let mut st = timer.state();
        if st.pending {
            st.pending = false;
            st.generation += 1;
            drop(st);
            self.inner().total_cancelled += 1;
        }
    }

    /// Earliest live deadline
    pub(crate) fn next_deadline_ns(&self) -> Option<i64> {
        let mut inner = self.inner();
        inner.purge();
        inner.heap.peek().map(|e| e.expire_ns)
    }

    /// Fire every timer due at the clock's current reading. Callbacks run
    /// with no list lock held and may re-arm themselves.
    pub(crate) fn run_due(&self) -> usize {
        if !self.clock.is_enabled() {
            return 0;
        }
        let now = self.clock.now_ns();
        let mut fired = 0;

        loop {
            let entry = {
                let mut inner = self.inner();
                inner.purge();
                match inner.heap.peek() {
                    Some(top) if top.expire_ns <= now => inner.heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            let Some(timer) = entry.timer.upgrade() else { continue };

            {
                let mut st = timer.state();
                if !st.pending || st.generation != entry.generation {
                    continue;
                }
                st.pending = false;
            }

            timer.fire();
            fired += 1;
        }

        if fired > 0 {
            self.inner().total_fired += fired as u64;
        }
        fired
    }

    pub(crate) fn stats(&self) -> TimerListStats {
        let inner = self.inner();
        TimerListStats {
            queued: inner.heap.len(),
            total_armed: inner.total_armed,
            total_fired: inner.total_fired,
            total_cancelled: inner.total_cancelled,
        }
    }
}
