//! `EventNotifier` - eventfd-backed wakeup primitive.
//!
//! `set()` bumps the eventfd counter from any thread; the counter coalesces,
//! so many `set()` calls before the loop reads the descriptor cost one
//! wakeup. `test_and_clear()` drains it on the loop thread.

use hostloop_core::error::InitError;

use std::os::unix::io::RawFd;

use crate::sys::errno;

pub struct EventNotifier {
    fd: RawFd,
}

impl EventNotifier {
    /// Create a new non-blocking, close-on-exec eventfd.
    pub fn new() -> Result<Self, InitError> {
        // Safety: plain syscall, no pointers
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(InitError::EventNotifier(errno()));
        }
        Ok(Self { fd })
    }

    /// Raw descriptor, readable while a notification is pending.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Raise the notification. Never blocks.
    pub fn set(&self) {
        let val: u64 = 1;
        // Safety: writing 8 bytes from a live u64
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated, so a wakeup is already pending.
        if ret < 0 && errno() != libc::EAGAIN {
            hostloop_core::kwarn!("event notifier {}: write failed, errno {}", self.fd, errno());
        }
    }

    /// Drain the notification; true if one was pending.
    pub fn test_and_clear(&self) -> bool {
        let mut val: u64 = 0;
        let mut any = false;
        loop {
            // Safety: reading 8 bytes into a live u64
            let ret = unsafe {
                libc::read(
                    self.fd,
                    &mut val as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret > 0 {
                any = true;
                continue;
            }
            if ret < 0 && errno() == libc::EINTR {
                continue;
            }
            return any;
        }
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            // Safety: we own the descriptor
            unsafe { libc::close(self.fd); }
            self.fd = -1;
        }
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier").field("fd", &self.fd).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_coalesces() {
        let n = EventNotifier::new().unwrap();
        assert!(!n.test_and_clear());

        n.set();
        n.set();
        n.set();
        assert!(n.test_and_clear());
        assert!(!n.test_and_clear());
    }

    #[test]
    fn test_set_from_other_thread() {
        let n = std::sync::Arc::new(EventNotifier::new().unwrap());
        let n2 = std::sync::Arc::clone(&n);
        std::thread::spawn(move || n2.set()).join().unwrap();
        assert!(n.test_and_clear());
    }
}
