//! Event-source framework
//!
//! A priority-ordered set of [`EventSource`]s driven through four phases per
//! iteration:
//!
//! 1. `prepare` - each source may report itself ready and shrink the timeout
//! 2. `query` - each source lists the descriptors it waits on
//! 3. `check` - after the host wait, each source inspects its results
//! 4. `dispatch` - ready sources at the best priority run their callbacks
//!
//! Lower priority values run first. Once a source at priority `p` is ready,
//! sources with a numerically higher priority are neither queried nor
//! dispatched for that iteration.
//!
//! The framework never waits by itself: callers (see
//! [`fusion::EventSourceFusion`]) fold its requests into the host wait.

pub mod poll_array;
pub mod fusion;
pub mod builtin;

pub use poll_array::PollRequestArray;
pub use fusion::EventSourceFusion;
pub use builtin::{IdleSource, TimeoutSource};

use std::ops::Range;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hostloop_core::constants::PRIORITY_NONE;
use hostloop_core::IoCondition;

use crate::sys::PollRequest;

/// A pluggable event source.
///
/// Timeouts are framework milliseconds: `-1` means "no opinion".
pub trait EventSource: Send {
    /// Called before the wait. Return `true` if ready without waiting.
    /// May lower `timeout_ms`.
    fn prepare(&mut self, timeout_ms: &mut i32) -> bool {
        let _ = timeout_ms;
        false
    }

    /// Append the descriptors this source waits on.
    fn query(&self, fds: &mut Vec<(RawFd, IoCondition)>) {
        let _ = fds;
    }

    /// Called after the wait with this source's entries, results filled in.
    fn check(&mut self, fds: &[PollRequest]) -> bool {
        let _ = fds;
        false
    }

    /// Run the source. Returning `false` removes it from the context.
    fn dispatch(&mut self) -> bool;

    /// Name for debugging
    fn name(&self) -> &'static str {
        "source"
    }
}

/// Identity of an attached source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

struct SourceEntry {
    id: SourceId,
    priority: i32,
    source: Mutex<Box<dyn EventSource>>,
    destroyed: AtomicBool,
    /// Set by prepare/check, consumed by dispatch
    ready: AtomicBool,
    /// Slots this source occupies in the last queried array
    slots: Mutex<Range<usize>>,
}

impl SourceEntry {
    fn source(&self) -> MutexGuard<'_, Box<dyn EventSource>> {
        self.source.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_slots(&self, slots: Range<usize>) {
        *self.slots.lock().unwrap_or_else(|p| p.into_inner()) = slots;
    }

    fn slots(&self) -> Range<usize> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Outcome of the prepare phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    /// Some source is ready without waiting
    pub ready: bool,
    /// Priority ceiling for query/check
    pub max_priority: i32,
    /// Framework timeout in milliseconds, -1 for none
    pub timeout_ms: i32,
}

/// Priority-ordered collection of event sources
pub struct SourceContext {
    sources: Mutex<Vec<Arc<SourceEntry>>>,
    pending: Mutex<Vec<Arc<SourceEntry>>>,
    next_id: AtomicU64,
}

impl SourceContext {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<SourceEntry>>> {
        self.sources.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<SourceEntry>> {
        self.entries().clone()
    }

    /// Attach `source` at `priority`. Sources of equal priority keep
    /// attachment order.
    pub fn attach(&self, source: Box<dyn EventSource>, priority: i32) -> SourceId {
        let id = SourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = source.name();
        let entry = Arc::new(SourceEntry {
            id,
            priority,
            source: Mutex::new(source),
            destroyed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            slots: Mutex::new(0..0),
        });

        let mut entries = self.entries();
        let pos = entries.partition_point(|e| e.priority <= priority);
        entries.insert(pos, entry);
        drop(entries);

        hostloop_core::kdebug!("source: attached {} id={} priority={}", name, id.0, priority);
        id
    }

    /// Detach a source. Unknown ids are ignored. A source removed between
    /// check and dispatch is not dispatched.
    pub fn remove(&self, id: SourceId) -> bool {
        let mut entries = self.entries();
        match entries.iter().position(|e| e.id == id) {
            Some(i) => {
                let entry = entries.remove(i);
                entry.destroyed.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.entries().iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Prepare phase: find ready sources and the framework timeout.
    pub fn prepare(&self) -> Prepared {
        let mut out = Prepared {
            ready: false,
            max_priority: PRIORITY_NONE,
            timeout_ms: -1,
        };

        for entry in self.snapshot() {
            if entry.destroyed.load(Ordering::Acquire) {
                continue;
            }
            if out.ready && entry.priority > out.max_priority {
                break;
            }

            let mut source_timeout = -1;
            let ready = entry.source().prepare(&mut source_timeout);
            entry.ready.store(ready, Ordering::Release);

            if ready {
                out.ready = true;
                out.max_priority = entry.priority;
            } else if source_timeout >= 0
                && (out.timeout_ms < 0 || source_timeout < out.timeout_ms)
            {
                out.timeout_ms = source_timeout;
            }
        }

        if out.ready {
            out.timeout_ms = 0;
        }
        out
    }

    /// Query phase: append the descriptors of every source at or below
    /// `max_priority`. Returns the number of entries added.
    pub fn query(&self, max_priority: i32, array: &mut PollRequestArray) -> usize {
        let start = array.len();
        let mut scratch = Vec::new();

        for entry in self.snapshot() {
            entry.set_slots(0..0);
            if entry.destroyed.load(Ordering::Acquire) || entry.priority > max_priority {
                continue;
            }
            scratch.clear();
            entry.source().query(&mut scratch);

            let first = array.len();
            for &(fd, events) in &scratch {
                array.push(fd, events);
            }
            entry.set_slots(first..array.len());
        }

        array.len() - start
    }

    /// Check phase: collect ready sources at the best priority for dispatch.
    /// Returns true if anything will be dispatched.
    pub fn check(&self, max_priority: i32, array: &PollRequestArray) -> bool {
        let mut ceiling = max_priority;
        let mut ready_list = Vec::new();

        for entry in self.snapshot() {
            if entry.destroyed.load(Ordering::Acquire) {
                continue;
            }
            if entry.priority > ceiling {
                break;
            }

            let mut ready = entry.ready.load(Ordering::Acquire);
            if !ready {
                let slots = entry.slots();
                let fds = array.as_slice().get(slots).unwrap_or(&[]);
                ready = entry.source().check(fds);
            }

            if ready {
                entry.ready.store(true, Ordering::Release);
                ceiling = entry.priority;
                ready_list.push(entry);
            }
        }

        let any = !ready_list.is_empty();
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).extend(ready_list);
        any
    }

    /// Dispatch phase: run every source collected by `check`.
    pub fn dispatch(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()));

        for entry in pending {
            entry.ready.store(false, Ordering::Release);
            if entry.destroyed.load(Ordering::Acquire) {
                continue;
            }
            let keep = match entry.source.try_lock() {
                Ok(mut source) => source.dispatch(),
                // Already dispatching further up this thread's stack
                Err(std::sync::TryLockError::WouldBlock) => true,
                Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner().dispatch(),
            };
            if !keep {
                self.remove(entry.id);
            }
        }
    }

    /// One full non-waiting iteration. Returns true if anything ran.
    pub fn iteration(&self, array: &mut PollRequestArray) -> bool {
        let prepared = self.prepare();
        array.clear();
        self.query(prepared.max_priority, array);
        if crate::sys::poll(array.as_mut_slice(), hostloop_core::Timeout::ZERO) < 0 {
            for req in array.iter_mut() {
                req.revents = IoCondition::empty();
            }
        }
        let ready = self.check(prepared.max_priority, array);
        if ready {
            self.dispatch();
        }
        ready
    }
}

impl Default for SourceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceContext").field("sources", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Flag {
        name: &'static str,
        ready: Arc<AtomicBool>,
        log: Arc<Mutex<Vec<&'static str>>>,
        keep: bool,
    }

    impl EventSource for Flag {
        fn prepare(&mut self, _timeout_ms: &mut i32) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn dispatch(&mut self) -> bool {
            self.ready.store(false, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.name);
            self.keep
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    fn flag(
        name: &'static str,
        ready: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> (Box<Flag>, Arc<AtomicBool>) {
        let r = Arc::new(AtomicBool::new(ready));
        let src = Box::new(Flag { name, ready: Arc::clone(&r), log: Arc::clone(log), keep: true });
        (src, r)
    }

    #[test]
    fn test_best_priority_wins() {
        let ctx = SourceContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (low, _) = flag("low", true, &log);
        let (high, _) = flag("high", true, &log);
        let (peer, _) = flag("peer", true, &log);
        ctx.attach(low, 10);
        ctx.attach(high, -5);
        ctx.attach(peer, -5);

        let mut array = PollRequestArray::with_capacity(8);
        assert!(ctx.iteration(&mut array));
        assert_eq!(*log.lock().unwrap(), vec!["high", "peer"]);

        // Higher-priority sources consumed their readiness; now `low` runs
        assert!(ctx.iteration(&mut array));
        assert_eq!(log.lock().unwrap().last(), Some(&"low"));
    }

    #[test]
    fn test_prepare_ready_forces_zero_timeout() {
        let ctx = SourceContext::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (src, ready) = flag("a", false, &log);
        ctx.attach(src, 0);

        let p = ctx.prepare();
        assert!(!p.ready);
        assert_eq!(p.timeout_ms, -1);
        assert_eq!(p.max_priority, PRIORITY_NONE);

        ready.store(true, Ordering::SeqCst);
        let p = ctx.prepare();
        assert!(p.ready);
        assert_eq!(p.timeout_ms, 0);
        assert_eq!(p.max_priority, 0);
    }

    struct Once(Arc<AtomicUsize>);

    impl EventSource for Once {
        fn prepare(&mut self, _t: &mut i32) -> bool {
            true
        }
        fn dispatch(&mut self) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn test_dispatch_false_removes_source() {
        let ctx = SourceContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = ctx.attach(Box::new(Once(Arc::clone(&hits))), 0);

        let mut array = PollRequestArray::with_capacity(4);
        assert!(ctx.iteration(&mut array));
        assert!(!ctx.contains(id));
        assert!(!ctx.iteration(&mut array));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_between_check_and_dispatch_is_skipped() {
        let ctx = SourceContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = ctx.attach(Box::new(Once(Arc::clone(&hits))), 0);

        let mut array = PollRequestArray::with_capacity(4);
        let p = ctx.prepare();
        ctx.query(p.max_priority, &mut array);
        assert!(ctx.check(p.max_priority, &array));
        assert!(ctx.remove(id));
        ctx.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    struct Pipe {
        fd: RawFd,
        hits: Arc<AtomicUsize>,
    }

    impl EventSource for Pipe {
        fn query(&self, fds: &mut Vec<(RawFd, IoCondition)>) {
            fds.push((self.fd, IoCondition::IN));
        }
        fn check(&mut self, fds: &[PollRequest]) -> bool {
            fds.iter().any(|r| r.revents.contains(IoCondition::IN))
        }
        fn dispatch(&mut self) -> bool {
            let mut buf = [0u8; 16];
            unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            self.hits.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_descriptor_source_checks_its_slots() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = SourceContext::new();
        let hits = Arc::new(AtomicUsize::new(0));
        ctx.attach(Box::new(Pipe { fd: fds[0], hits: Arc::clone(&hits) }), 0);

        let mut array = PollRequestArray::with_capacity(4);
        assert!(!ctx.iteration(&mut array));
        assert_eq!(array.len(), 1);

        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr() as *const _, 1) }, 1);
        assert!(ctx.iteration(&mut array));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
