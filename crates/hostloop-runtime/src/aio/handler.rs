//! Descriptor handlers registered with the async context

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Mutex, TryLockError};

use hostloop_core::IoCondition;

use super::EventNotifier;

/// Read or write callback
pub type IoHandler = Box<dyn FnMut() + Send>;

/// Returns true while the handler still has requests in flight
pub type AioFlushHandler = Box<dyn FnMut() -> bool + Send>;

/// Callback for a readable event notifier
pub type EventNotifierHandler = Box<dyn FnMut(&EventNotifier) + Send>;

/// Flush callback for an event notifier
pub type EventNotifierFlushHandler = Box<dyn FnMut(&EventNotifier) -> bool + Send>;

// Run a callback unless it is already running further up the stack.
fn call_once<T: ?Sized, R>(slot: &Mutex<Box<T>>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    match slot.try_lock() {
        Ok(mut guard) => Some(f(&mut **guard)),
        Err(TryLockError::Poisoned(p)) => Some(f(&mut **p.into_inner())),
        Err(TryLockError::WouldBlock) => None,
    }
}

pub(crate) struct AioHandler {
    pub(crate) fd: RawFd,
    read: Option<Mutex<IoHandler>>,
    write: Option<Mutex<IoHandler>>,
    flush: Option<Mutex<AioFlushHandler>>,
    deleted: AtomicBool,
    revents: AtomicU16,
    /// The context's own notifier; running it is not progress
    pub(crate) internal: bool,
}

impl AioHandler {
    pub(crate) fn new(
        fd: RawFd,
        read: Option<IoHandler>,
        write: Option<IoHandler>,
        flush: Option<AioFlushHandler>,
        internal: bool,
    ) -> Self {
        Self {
            fd,
            read: read.map(Mutex::new),
            write: write.map(Mutex::new),
            flush: flush.map(Mutex::new),
            deleted: AtomicBool::new(false),
            revents: AtomicU16::new(0),
            internal,
        }
    }

    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Poll interest derived from the registered callbacks
    pub(crate) fn events(&self) -> IoCondition {
        let mut ev = IoCondition::empty();
        if self.read.is_some() {
            ev |= IoCondition::IN | IoCondition::HUP | IoCondition::ERR;
        }
        if self.write.is_some() {
            ev |= IoCondition::OUT | IoCondition::ERR;
        }
        ev
    }

    pub(crate) fn add_revents(&self, revents: IoCondition) {
        self.revents.fetch_or(revents.bits(), Ordering::AcqRel);
    }

    pub(crate) fn take_revents(&self) -> IoCondition {
        IoCondition::from_bits_truncate(self.revents.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn has_revents(&self) -> bool {
        self.revents.load(Ordering::Acquire) != 0
    }

    /// `None` without a flush callback, otherwise whether requests are in
    /// flight.
    pub(crate) fn flush_pending(&self) -> Option<bool> {
        let slot = self.flush.as_ref()?;
        Some(call_once(slot, |f| f()).unwrap_or(false))
    }

    /// Run the read callback; true if it ran.
    pub(crate) fn run_read(&self) -> bool {
        match &self.read {
            Some(slot) => call_once(slot, |f| f()).is_some(),
            None => false,
        }
    }

    /// Run the write callback; true if it ran.
    pub(crate) fn run_write(&self) -> bool {
        match &self.write {
            Some(slot) => call_once(slot, |f| f()).is_some(),
            None => false,
        }
    }
}

impl std::fmt::Debug for AioHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioHandler")
            .field("fd", &self.fd)
            .field("events", &self.events())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
