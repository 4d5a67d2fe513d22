//! Device I/O handler registry
//!
//! Per-descriptor read/write callbacks folded into the `select(2)` sets each
//! iteration. A read callback may be gated by a `can_read` predicate
//! evaluated while the sets are built.
//!
//! Dispatch runs in registration order and only after a wait that reported
//! readiness. A handler removed by an earlier callback in the same pass is
//! not called.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use hostloop_core::LoopResult;

use crate::aio::IoHandler;
use crate::fdset::{check_select_range, DescriptorSet};

/// Returns true when the read callback can accept data
pub type CanReadHandler = Box<dyn FnMut() -> bool + Send>;

/// The device I/O collaborator of the main loop
pub trait DeviceIoMultiplexer: Send + Sync {
    /// Add interest for every registered descriptor
    fn fill_descriptors(&self, sets: &mut DescriptorSet);

    /// Dispatch after a wait that returned `result`
    fn poll_descriptors(&self, sets: &DescriptorSet, result: i32);
}

struct IoHandlerRecord {
    fd: RawFd,
    can_read: Option<Mutex<CanReadHandler>>,
    read: Option<Mutex<IoHandler>>,
    write: Option<Mutex<IoHandler>>,
    deleted: AtomicBool,
}

fn run<T: ?Sized, R>(slot: &Mutex<Box<T>>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    match slot.try_lock() {
        Ok(mut guard) => Some(f(&mut **guard)),
        Err(TryLockError::Poisoned(p)) => Some(f(&mut **p.into_inner())),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl IoHandlerRecord {
    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub struct IoHandlerRegistry {
    handlers: Mutex<Vec<Arc<IoHandlerRecord>>>,
}

impl IoHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<Arc<IoHandlerRecord>>> {
        self.handlers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register callbacks for `fd`, replacing any previous registration in
    /// place. Passing no read and no write callback removes it, which never
    /// fails.
    ///
    /// Fails with [`LoopError::DescriptorOutOfRange`] when `fd` cannot be
    /// waited on by `select(2)`; the registry is left unchanged.
    ///
    /// [`LoopError::DescriptorOutOfRange`]: hostloop_core::LoopError::DescriptorOutOfRange
    pub fn set_fd_handler2(
        &self,
        fd: RawFd,
        can_read: Option<CanReadHandler>,
        read: Option<IoHandler>,
        write: Option<IoHandler>,
    ) -> LoopResult<()> {
        if read.is_none() && write.is_none() {
            self.remove(fd);
            return Ok(());
        }
        check_select_range(fd)?;

        let mut handlers = self.handlers();
        let existing = handlers.iter().position(|h| h.fd == fd);

        let record = Arc::new(IoHandlerRecord {
            fd,
            can_read: can_read.map(Mutex::new),
            read: read.map(Mutex::new),
            write: write.map(Mutex::new),
            deleted: AtomicBool::new(false),
        });
        match existing {
            Some(i) => {
                let old = std::mem::replace(&mut handlers[i], record);
                old.deleted.store(true, Ordering::Release);
            }
            None => handlers.push(record),
        }
        Ok(())
    }

    pub fn set_fd_handler(
        &self,
        fd: RawFd,
        read: Option<IoHandler>,
        write: Option<IoHandler>,
    ) -> LoopResult<()> {
        self.set_fd_handler2(fd, None, read, write)
    }

    /// Drop the registration for `fd`, if any.
    pub fn remove(&self, fd: RawFd) -> bool {
        let mut handlers = self.handlers();
        match handlers.iter().position(|h| h.fd == fd) {
            Some(i) => {
                handlers.remove(i).deleted.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers().is_empty()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.handlers().iter().any(|h| h.fd == fd)
    }
}

impl DeviceIoMultiplexer for IoHandlerRegistry {
    fn fill_descriptors(&self, sets: &mut DescriptorSet) {
        let snapshot = self.handlers().clone();
        for h in snapshot {
            if h.is_deleted() {
                continue;
            }
            if h.read.is_some() {
                let wants = match &h.can_read {
                    Some(pred) => run(pred, |f| f()).unwrap_or(false),
                    None => true,
                };
                if wants {
                    sets.add_read(h.fd);
                }
            }
            if h.write.is_some() {
                sets.add_write(h.fd);
            }
        }
    }

    fn poll_descriptors(&self, sets: &DescriptorSet, result: i32) {
        if result <= 0 {
            return;
        }
        let snapshot = self.handlers().clone();
        for h in snapshot {
            if let Some(read) = &h.read {
                if !h.is_deleted() && sets.read.contains(h.fd) {
                    run(read, |f| f());
                }
            }
            if let Some(write) = &h.write {
                if !h.is_deleted() && sets.write.contains(h.fd) {
                    run(write, |f| f());
                }
            }
        }
    }
}

impl std::fmt::Debug for IoHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fds: Vec<RawFd> = self.handlers().iter().map(|h| h.fd).collect();
        f.debug_struct("IoHandlerRegistry").field("fds", &fds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(hits: &Arc<AtomicUsize>) -> IoHandler {
        let h = Arc::clone(hits);
        Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fill_respects_can_read() {
        let reg = IoHandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(false));
        let o = Arc::clone(&open);
        reg.set_fd_handler2(5, Some(Box::new(move || o.load(Ordering::SeqCst))), Some(counting(&hits)), None)
            .unwrap();
        reg.set_fd_handler(6, None, Some(counting(&hits))).unwrap();

        let mut sets = DescriptorSet::new();
        reg.fill_descriptors(&mut sets);
        assert!(!sets.read.contains(5));
        assert!(sets.write.contains(6));

        open.store(true, Ordering::SeqCst);
        sets.reset();
        reg.fill_descriptors(&mut sets);
        assert!(sets.read.contains(5));
    }

    #[test]
    fn test_poll_only_after_positive_result() {
        let reg = IoHandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        reg.set_fd_handler(5, Some(counting(&hits)), None).unwrap();

        let mut sets = DescriptorSet::new();
        sets.add_read(5);
        reg.poll_descriptors(&sets, 0);
        reg.poll_descriptors(&sets, -1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        reg.poll_descriptors(&sets, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_removed_mid_pass_is_skipped() {
        let reg = Arc::new(IoHandlerRegistry::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&reg);
        let remove_six: IoHandler = Box::new(move || {
            r.remove(6);
        });
        reg.set_fd_handler(5, Some(remove_six), None).unwrap();
        reg.set_fd_handler(6, Some(counting(&hits)), None).unwrap();

        let mut sets = DescriptorSet::new();
        sets.add_read(5);
        sets.add_read(6);
        reg.poll_descriptors(&sets, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!reg.contains(6));
        assert!(reg.contains(5));
    }

    #[test]
    fn test_replace_keeps_position() {
        let reg = IoHandlerRegistry::new();
        reg.set_fd_handler(5, Some(Box::new(|| {})), None).unwrap();
        reg.set_fd_handler(6, Some(Box::new(|| {})), None).unwrap();
        reg.set_fd_handler(5, None, Some(Box::new(|| {}))).unwrap();
        assert_eq!(format!("{:?}", reg), "IoHandlerRegistry { fds: [5, 6] }");
    }

    #[test]
    fn test_descriptor_beyond_select_range_is_rejected() {
        let reg = IoHandlerRegistry::new();
        let fd = crate::fdset::FD_SETSIZE as RawFd + 476;
        let err = reg.set_fd_handler(fd, Some(Box::new(|| {})), None).unwrap_err();
        assert_eq!(
            err,
            hostloop_core::LoopError::DescriptorOutOfRange { fd, limit: crate::fdset::FD_SETSIZE }
        );
        assert!(reg.is_empty());

        // Removal of an unknown descriptor is still fine
        assert!(reg.set_fd_handler(fd, None, None).is_ok());

        let mut sets = DescriptorSet::new();
        reg.fill_descriptors(&mut sets);
        assert!(sets.is_empty());
    }
}
