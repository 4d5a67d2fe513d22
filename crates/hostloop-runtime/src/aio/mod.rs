//! Asynchronous I/O context
//!
//! Owns an [`EventNotifier`] for cross-thread wakeups, a set of descriptor
//! handlers and the bottom-half queue. It plugs into the event-source
//! framework through [`AioSource`], and can also be driven on its own with
//! [`AioContext::poll`] when a caller needs to wait for in-flight requests.
//!
//! ```text
//! any thread            loop thread
//! ──────────            ───────────
//! bh.schedule() ──┐
//! ctx.notify() ───┴──▶ eventfd ──▶ host wait wakes ──▶ AioSource::dispatch
//!                                                       ├─ bottom halves
//!                                                       └─ fd handlers
//! ```

mod bh;
mod handler;
mod notifier;

pub use bh::BottomHalf;
pub use handler::{AioFlushHandler, EventNotifierFlushHandler, EventNotifierHandler, IoHandler};
pub use notifier::EventNotifier;

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use hostloop_core::error::InitError;
use hostloop_core::{IoCondition, Timeout};

use crate::source::EventSource;
use crate::sys::{self, PollRequest};
use bh::BhQueue;
use handler::AioHandler;

pub struct AioContext {
    notifier: Arc<EventNotifier>,
    handlers: Mutex<Vec<Arc<AioHandler>>>,
    bh: BhQueue,
    idle_bh_interval_ms: u32,
}

impl AioContext {
    /// Create a context whose idle bottom halves run at least every
    /// `idle_bh_interval_ms`.
    pub fn new(idle_bh_interval_ms: u32) -> Result<Arc<Self>, InitError> {
        let notifier = Arc::new(EventNotifier::new()?);
        let ctx = Arc::new(Self {
            notifier: Arc::clone(&notifier),
            handlers: Mutex::new(Vec::new()),
            bh: BhQueue::new(),
            idle_bh_interval_ms,
        });

        let n = Arc::clone(&notifier);
        ctx.install(
            notifier.fd(),
            Some(Box::new(move || {
                n.test_and_clear();
            })),
            None,
            None,
            true,
        );
        Ok(ctx)
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<Arc<AioHandler>>> {
        self.handlers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<AioHandler>> {
        self.handlers().clone()
    }

    /// Wake the loop from any thread.
    #[inline]
    pub fn notify(&self) {
        self.notifier.set();
    }

    #[inline]
    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    pub fn bh_new(self: &Arc<Self>, func: impl FnMut() + Send + 'static) -> BottomHalf {
        BottomHalf::new(self, Box::new(func))
    }

    /// Run scheduled bottom halves. True if a non-idle one ran.
    pub fn bh_poll(&self) -> bool {
        self.bh.poll()
    }

    fn install(
        &self,
        fd: RawFd,
        read: Option<IoHandler>,
        write: Option<IoHandler>,
        flush: Option<AioFlushHandler>,
        internal: bool,
    ) {
        let mut handlers = self.handlers();
        let existing = handlers.iter().position(|h| h.fd == fd && !h.is_deleted());

        if read.is_none() && write.is_none() {
            if let Some(i) = existing {
                handlers.remove(i).mark_deleted();
            }
            return;
        }

        let entry = Arc::new(AioHandler::new(fd, read, write, flush, internal));
        match existing {
            Some(i) => {
                let old = std::mem::replace(&mut handlers[i], entry);
                old.mark_deleted();
            }
            None => handlers.push(entry),
        }
    }

    /// Register read/write callbacks for `fd`, replacing any previous ones.
    /// Passing neither removes the registration. The optional flush callback
    /// reports in-flight requests and decides whether [`poll`](Self::poll)
    /// has anything to wait for.
    pub fn set_fd_handler(
        &self,
        fd: RawFd,
        read: Option<IoHandler>,
        write: Option<IoHandler>,
        flush: Option<AioFlushHandler>,
    ) {
        self.install(fd, read, write, flush, false);
    }

    /// Register a callback for an event notifier becoming readable.
    /// `None` removes it.
    pub fn set_event_notifier(
        &self,
        notifier: &Arc<EventNotifier>,
        read: Option<EventNotifierHandler>,
        flush: Option<EventNotifierFlushHandler>,
    ) {
        let read = read.map(|mut f| {
            let n = Arc::clone(notifier);
            Box::new(move || f(&n)) as IoHandler
        });
        let flush = flush.map(|mut f| {
            let n = Arc::clone(notifier);
            Box::new(move || f(&n)) as AioFlushHandler
        });
        self.install(notifier.fd(), read, None, flush, false);
    }

    /// Number of live descriptor handlers, the internal notifier included
    pub fn handler_count(&self) -> usize {
        self.handlers().len()
    }

    /// Run handlers with pending results. True if a registered (non-internal)
    /// handler ran.
    pub fn dispatch(&self) -> bool {
        let mut progress = false;
        for h in self.snapshot() {
            let revents = h.take_revents();
            if h.is_deleted() || revents.is_empty() {
                continue;
            }
            if revents.intersects(IoCondition::IN | IoCondition::HUP | IoCondition::ERR)
                && h.run_read()
                && !h.internal
            {
                progress = true;
            }
            if !h.is_deleted()
                && revents.intersects(IoCondition::OUT | IoCondition::ERR)
                && h.run_write()
                && !h.internal
            {
                progress = true;
            }
        }
        progress
    }

    /// Make progress on outstanding work.
    ///
    /// Runs bottom halves and handlers with pending results first. If that
    /// made progress and `blocking` is false, returns. Otherwise waits on the
    /// registered descriptors, but only if some flush callback reports
    /// requests in flight. Returns true if anything ran or was waited for.
    pub fn poll(&self, blocking: bool) -> bool {
        let mut blocking = blocking;
        let mut progress = false;

        if self.bh_poll() {
            blocking = false;
            progress = true;
        }
        if self.dispatch() {
            progress = true;
        }
        if progress && !blocking {
            return true;
        }

        let mut busy = false;
        let mut reqs = Vec::new();
        let mut owners = Vec::new();
        for h in self.snapshot() {
            if let Some(pending) = h.flush_pending() {
                if !pending {
                    continue;
                }
                busy = true;
            }
            let events = h.events();
            if !h.is_deleted() && !events.is_empty() {
                reqs.push(PollRequest::new(h.fd, events));
                owners.push(h);
            }
        }

        if !busy {
            return progress;
        }

        let timeout = if blocking { Timeout::INFINITE } else { Timeout::ZERO };
        let ret = sys::poll(&mut reqs, timeout);
        if ret < 0 {
            hostloop_core::kwarn!("aio: poll failed, errno {}", sys::errno());
        }
        for (req, h) in reqs.iter().zip(&owners) {
            if !req.revents.is_empty() {
                h.add_revents(req.revents);
            }
        }
        self.dispatch();
        true
    }

    /// Event source adapter for attaching to a [`SourceContext`](crate::source::SourceContext)
    pub fn source(self: &Arc<Self>) -> AioSource {
        AioSource { ctx: Arc::clone(self) }
    }
}

impl std::fmt::Debug for AioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioContext")
            .field("notifier", &self.notifier.fd())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// [`AioContext`] as an event source
pub struct AioSource {
    ctx: Arc<AioContext>,
}

impl EventSource for AioSource {
    fn prepare(&mut self, timeout_ms: &mut i32) -> bool {
        let pending = self.ctx.bh.pending();
        if pending.busy {
            *timeout_ms = 0;
            return true;
        }
        if pending.idle {
            *timeout_ms = self.ctx.idle_bh_interval_ms.min(i32::MAX as u32) as i32;
        }
        false
    }

    fn query(&self, fds: &mut Vec<(RawFd, IoCondition)>) {
        for h in self.ctx.handlers().iter() {
            let events = h.events();
            if !h.is_deleted() && !events.is_empty() {
                fds.push((h.fd, events));
            }
        }
    }

    fn check(&mut self, fds: &[PollRequest]) -> bool {
        let handlers = self.ctx.snapshot();
        for req in fds.iter().filter(|r| !r.revents.is_empty()) {
            if let Some(h) = handlers.iter().find(|h| h.fd == req.fd && !h.is_deleted()) {
                h.add_revents(req.revents);
            }
        }
        handlers.iter().any(|h| h.has_revents()) || self.ctx.bh.pending().busy
    }

    fn dispatch(&mut self) -> bool {
        self.ctx.bh_poll();
        self.ctx.dispatch();
        true
    }

    fn name(&self) -> &'static str {
        "aio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn test_set_fd_handler_replace_and_remove() {
        let ctx = AioContext::new(10).unwrap();
        assert_eq!(ctx.handler_count(), 1);

        ctx.set_fd_handler(42, Some(Box::new(|| {})), None, None);
        ctx.set_fd_handler(42, None, Some(Box::new(|| {})), None);
        assert_eq!(ctx.handler_count(), 2);

        ctx.set_fd_handler(42, None, None, None);
        assert_eq!(ctx.handler_count(), 1);

        // Removing an unknown descriptor is a no-op
        ctx.set_fd_handler(43, None, None, None);
        assert_eq!(ctx.handler_count(), 1);
    }

    #[test]
    fn test_poll_without_busy_handlers_returns_immediately() {
        let ctx = AioContext::new(10).unwrap();
        let (r, w) = pipe();
        ctx.set_fd_handler(r, Some(Box::new(|| {})), None, None);
        // No flush callback means nothing is in flight, so even a blocking
        // poll must not wait
        assert!(!ctx.poll(true));
        ctx.set_fd_handler(r, None, None, None);
        close(&[r, w]);
    }

    #[test]
    fn test_poll_waits_for_in_flight_request() {
        let ctx = AioContext::new(10).unwrap();
        let (r, w) = pipe();
        let done = Arc::new(AtomicBool::new(false));

        let d = Arc::clone(&done);
        let read: IoHandler = Box::new(move || {
            let mut buf = [0u8; 8];
            unsafe { libc::read(r, buf.as_mut_ptr() as *mut _, buf.len()) };
            d.store(true, Ordering::SeqCst);
        });
        let d = Arc::clone(&done);
        let flush: AioFlushHandler = Box::new(move || !d.load(Ordering::SeqCst));
        ctx.set_fd_handler(r, Some(read), None, Some(flush));

        let writer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
            w
        });

        while !done.load(Ordering::SeqCst) {
            assert!(ctx.poll(true));
        }
        // Request complete: nothing left to wait for
        assert!(!ctx.poll(true));

        let w = writer.join().unwrap();
        ctx.set_fd_handler(r, None, None, None);
        close(&[r, w]);
    }

    #[test]
    fn test_source_dispatches_ready_handler() {
        let ctx = AioContext::new(10).unwrap();
        let (r, w) = pipe();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ctx.set_fd_handler(
            r,
            Some(Box::new(move || {
                let mut buf = [0u8; 8];
                unsafe { libc::read(r, buf.as_mut_ptr() as *mut _, buf.len()) };
                h.fetch_add(1, Ordering::SeqCst);
            })),
            None,
            None,
        );

        let sources = crate::source::SourceContext::new();
        sources.attach(Box::new(ctx.source()), 0);
        let mut array = crate::source::PollRequestArray::with_capacity(8);

        assert!(!sources.iteration(&mut array));
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        assert!(sources.iteration(&mut array));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        ctx.set_fd_handler(r, None, None, None);
        close(&[r, w]);
    }

    #[test]
    fn test_event_notifier_handler() {
        let ctx = AioContext::new(10).unwrap();
        let n = Arc::new(EventNotifier::new().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ctx.set_event_notifier(
            &n,
            Some(Box::new(move |n: &EventNotifier| {
                if n.test_and_clear() {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            })),
            Some(Box::new(|_: &EventNotifier| true)),
        );

        n.set();
        assert!(ctx.poll(false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        ctx.set_event_notifier(&n, None, None);
        assert_eq!(ctx.handler_count(), 1);
    }
}
