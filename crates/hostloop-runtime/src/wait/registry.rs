//! Registries consulted by the handle-polling wait
//!
//! - [`PollingRegistry`]: callbacks run at the top of every wait; any
//!   nonzero result ends the wait early.
//! - [`WaitObjectTable`]: handles waited on alongside the framework's
//!   descriptors, each with an optional callback, capped at a fixed count.
//! - Notification descriptors: extra descriptors that only wake the wait.
//!
//! All three are internally synchronized so registration may happen from
//! any thread. Callbacks run with the registry unlocked.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use hostloop_core::{IoCondition, LoopError, LoopResult};

use crate::source::PollRequestArray;
use crate::sys::PollRequest;

/// Polling callback; nonzero means "something happened"
pub type PollingFunc = Box<dyn FnMut() -> i32 + Send>;

/// Callback for a signaled wait object
pub type WaitObjectFunc = Box<dyn FnMut() + Send>;

/// Identity of a registered polling callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollingToken(u64);

fn call<T: ?Sized, R>(slot: &Mutex<Box<T>>, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    match slot.try_lock() {
        Ok(mut guard) => Some(f(&mut **guard)),
        Err(TryLockError::Poisoned(p)) => Some(f(&mut **p.into_inner())),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Ordered polling callbacks
#[derive(Default)]
pub struct PollingRegistry {
    entries: Mutex<Vec<(PollingToken, Arc<Mutex<PollingFunc>>)>>,
    next: AtomicU64,
}

impl PollingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `func`; it runs after every callback registered before it.
    pub fn add(&self, func: PollingFunc) -> PollingToken {
        let token = PollingToken(self.next.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).push((token, Arc::new(Mutex::new(func))));
        token
    }

    /// Remove the callback registered as `token`. Unknown tokens are a no-op.
    pub fn remove(&self, token: PollingToken) -> bool {
        let mut entries = lock(&self.entries);
        match entries.iter().position(|(t, _)| *t == token) {
            Some(i) => {
                entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Run every callback in order and OR the results together.
    pub fn run_all(&self) -> i32 {
        let snapshot: Vec<_> = lock(&self.entries).iter().map(|(_, f)| Arc::clone(f)).collect();
        snapshot
            .iter()
            .fold(0, |acc, f| acc | call(&**f, |f| f()).unwrap_or(0))
    }

    /// Tokens in call order
    pub fn tokens(&self) -> Vec<PollingToken> {
        lock(&self.entries).iter().map(|(t, _)| *t).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl std::fmt::Debug for PollingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingRegistry").field("tokens", &self.tokens()).finish()
    }
}

/// Parallel arrays: handle, callback, last result
struct WaitObjects {
    handles: Vec<RawFd>,
    funcs: Vec<Option<Arc<Mutex<WaitObjectFunc>>>>,
    revents: Vec<IoCondition>,
}

/// Bounded table of wait objects
pub struct WaitObjectTable {
    capacity: usize,
    objects: Mutex<WaitObjects>,
}

impl WaitObjectTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            objects: Mutex::new(WaitObjects {
                handles: Vec::with_capacity(capacity),
                funcs: Vec::with_capacity(capacity),
                revents: Vec::with_capacity(capacity),
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `handle`. Fails without modifying the table when it is full.
    pub fn add(&self, handle: RawFd, func: Option<WaitObjectFunc>) -> LoopResult<()> {
        let mut objs = lock(&self.objects);
        if objs.handles.len() >= self.capacity {
            return Err(LoopError::CapacityExceeded {
                what: "wait object table",
                capacity: self.capacity,
            });
        }
        objs.handles.push(handle);
        objs.funcs.push(func.map(|f| Arc::new(Mutex::new(f))));
        objs.revents.push(IoCondition::empty());
        Ok(())
    }

    /// Remove the first entry for `handle`, shifting later entries down.
    /// Unknown handles are a no-op.
    pub fn remove(&self, handle: RawFd) -> bool {
        let mut objs = lock(&self.objects);
        match objs.handles.iter().position(|&h| h == handle) {
            Some(i) => {
                objs.handles.remove(i);
                objs.funcs.remove(i);
                objs.revents.remove(i);
                true
            }
            None => false,
        }
    }

    /// Handles in table order
    pub fn handles(&self) -> Vec<RawFd> {
        lock(&self.objects).handles.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).handles.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.objects).handles.is_empty()
    }

    /// Append one readable-interest request per handle. Returns the count.
    pub fn append_requests(&self, array: &mut PollRequestArray) -> usize {
        let objs = lock(&self.objects);
        for &h in &objs.handles {
            array.push(h, IoCondition::IN);
        }
        objs.handles.len()
    }

    /// Record results for requests produced by `append_requests`, matched by
    /// position and handle.
    pub fn set_results(&self, results: &[PollRequest]) {
        let mut objs = lock(&self.objects);
        let objs = &mut *objs;
        for (i, req) in results.iter().enumerate() {
            if objs.handles.get(i) == Some(&req.fd) {
                objs.revents[i] = req.revents;
            }
        }
    }

    /// Invoke the callback of every signaled entry, in table order, and
    /// clear the results. Returns the number invoked.
    pub fn dispatch(&self) -> usize {
        let ready: Vec<Arc<Mutex<WaitObjectFunc>>> = {
            let mut objs = lock(&self.objects);
            let objs = &mut *objs;
            objs.revents
                .iter_mut()
                .zip(&objs.funcs)
                .filter_map(|(rev, func)| {
                    let signaled = !std::mem::take(rev).is_empty();
                    match func {
                        Some(f) if signaled => Some(Arc::clone(f)),
                        _ => None,
                    }
                })
                .collect()
        };
        ready.iter().filter_map(|f| call(&**f, |f| f())).count()
    }
}

impl std::fmt::Debug for WaitObjectTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitObjectTable")
            .field("handles", &self.handles())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Everything the handle-polling wait consults besides the framework
pub struct HandleRegistry {
    pub polling: PollingRegistry,
    pub wait_objects: WaitObjectTable,
    notify_fds: Mutex<Vec<RawFd>>,
}

impl HandleRegistry {
    pub fn new(max_wait_objects: usize) -> Self {
        Self {
            polling: PollingRegistry::new(),
            wait_objects: WaitObjectTable::new(max_wait_objects),
            notify_fds: Mutex::new(Vec::new()),
        }
    }

    /// Wake the wait whenever `fd` has input or priority data.
    pub fn fd_register(&self, fd: RawFd) {
        let mut fds = lock(&self.notify_fds);
        if !fds.contains(&fd) {
            fds.push(fd);
        }
    }

    pub fn fd_unregister(&self, fd: RawFd) -> bool {
        let mut fds = lock(&self.notify_fds);
        match fds.iter().position(|&f| f == fd) {
            Some(i) => {
                fds.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn notify_fds(&self) -> Vec<RawFd> {
        lock(&self.notify_fds).clone()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("polling", &self.polling)
            .field("wait_objects", &self.wait_objects)
            .field("notify_fds", &self.notify_fds())
            .finish()
    }
}
