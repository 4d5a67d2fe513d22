//! Bottom halves: deferred callbacks run by the async context
//!
//! Any thread may schedule a bottom half. Schedules land in a lock-free
//! inbox ([`SegQueue`]); the loop thread drains the inbox into a staging
//! list it owns, so `prepare` can inspect what is pending without racing
//! producers.
//!
//! A bottom half is queued at most once at a time. Rescheduling from inside
//! its own callback queues it for the next poll, never the current one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_queue::SegQueue;

use super::AioContext;

pub(crate) struct BhInner {
    func: Mutex<Box<dyn FnMut() + Send>>,
    scheduled: AtomicBool,
    idle: AtomicBool,
    deleted: AtomicBool,
}

impl BhInner {
    fn is_pending(&self) -> bool {
        self.scheduled.load(Ordering::Acquire) && !self.deleted.load(Ordering::Acquire)
    }
}

/// Handle to a bottom half. Dropping it deletes the bottom half; a pending
/// run is discarded.
pub struct BottomHalf {
    inner: Arc<BhInner>,
    ctx: Weak<AioContext>,
}

impl BottomHalf {
    pub(crate) fn new(ctx: &Arc<AioContext>, func: Box<dyn FnMut() + Send>) -> Self {
        Self {
            inner: Arc::new(BhInner {
                func: Mutex::new(func),
                scheduled: AtomicBool::new(false),
                idle: AtomicBool::new(false),
                deleted: AtomicBool::new(false),
            }),
            ctx: Arc::downgrade(ctx),
        }
    }

    /// Run on the next loop iteration and wake the loop.
    pub fn schedule(&self) {
        self.inner.idle.store(false, Ordering::Release);
        if self.enqueue() {
            if let Some(ctx) = self.ctx.upgrade() {
                ctx.notify();
            }
        }
    }

    /// Run on some later iteration, at most `idle_bh_interval_ms` away,
    /// without waking the loop.
    pub fn schedule_idle(&self) {
        self.inner.idle.store(true, Ordering::Release);
        self.enqueue();
    }

    /// Discard a pending run. The bottom half can be scheduled again.
    pub fn cancel(&self) {
        self.inner.scheduled.store(false, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.is_pending()
    }

    // True if this call queued the bottom half
    fn enqueue(&self) -> bool {
        if self.inner.scheduled.swap(true, Ordering::AcqRel) {
            return true;
        }
        match self.ctx.upgrade() {
            Some(ctx) => {
                ctx.bh.inbox.push(Arc::clone(&self.inner));
                true
            }
            None => {
                self.inner.scheduled.store(false, Ordering::Release);
                false
            }
        }
    }
}

impl Drop for BottomHalf {
    fn drop(&mut self) {
        self.inner.deleted.store(true, Ordering::Release);
        self.inner.scheduled.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for BottomHalf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottomHalf")
            .field("scheduled", &self.inner.scheduled.load(Ordering::Relaxed))
            .field("idle", &self.inner.idle.load(Ordering::Relaxed))
            .finish()
    }
}

/// Scheduled state seen by `prepare`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BhPending {
    pub busy: bool,
    pub idle: bool,
}

pub(crate) struct BhQueue {
    inbox: SegQueue<Arc<BhInner>>,
    staged: Mutex<Vec<Arc<BhInner>>>,
}

impl BhQueue {
    pub(crate) fn new() -> Self {
        Self {
            inbox: SegQueue::new(),
            staged: Mutex::new(Vec::new()),
        }
    }

    fn stage(&self, staged: &mut Vec<Arc<BhInner>>) {
        while let Some(bh) = self.inbox.pop() {
            staged.push(bh);
        }
    }

    pub(crate) fn pending(&self) -> BhPending {
        let mut staged = self.staged.lock().unwrap_or_else(|p| p.into_inner());
        self.stage(&mut staged);
        staged.retain(|bh| bh.is_pending());

        let mut out = BhPending::default();
        for bh in staged.iter() {
            if bh.idle.load(Ordering::Acquire) {
                out.idle = true;
            } else {
                out.busy = true;
            }
        }
        out
    }

    /// Run every bottom half queued so far. Returns true if a non-idle one
    /// ran.
    pub(crate) fn poll(&self) -> bool {
        let batch = {
            let mut staged = self.staged.lock().unwrap_or_else(|p| p.into_inner());
            self.stage(&mut staged);
            std::mem::take(&mut *staged)
        };

        let mut progress = false;
        for bh in batch {
            if bh.deleted.load(Ordering::Acquire) {
                continue;
            }
            if !bh.scheduled.swap(false, Ordering::AcqRel) {
                continue;
            }
            if !bh.idle.swap(false, Ordering::AcqRel) {
                progress = true;
            }
            match bh.func.try_lock() {
                Ok(mut func) => (*func)(),
                Err(std::sync::TryLockError::Poisoned(p)) => {
                    let mut func = p.into_inner();
                    (*func)()
                }
                // Re-entered from its own callback via a nested poll
                Err(std::sync::TryLockError::WouldBlock) => {
                    bh.scheduled.store(true, Ordering::Release);
                    self.inbox.push(Arc::clone(&bh));
                }
            }
        }
        progress
    }
}
