//! Descriptor-set wait

use hostloop_core::{BigLockGuard, Timeout};

use super::HostWait;
use crate::fdset::DescriptorSet;
use crate::source::EventSourceFusion;
use crate::sys;

#[derive(Debug, Default)]
pub struct SelectWait {
    _private: (),
}

impl SelectWait {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostWait for SelectWait {
    fn name(&self) -> &'static str {
        "select"
    }

    fn wait(
        &mut self,
        fusion: &mut EventSourceFusion,
        sets: &mut DescriptorSet,
        timeout: Timeout,
        guard: &mut BigLockGuard<'_>,
    ) -> i32 {
        let mut timeout = timeout;
        fusion.fill(sets, &mut timeout);

        // A zero-timeout wait cannot block, so keep the lock
        let ret = if timeout.is_zero() {
            sys::select(sets, timeout)
        } else {
            guard.unlocked(|| sys::select(sets, timeout))
        };

        if ret < 0 {
            hostloop_core::kdebug!("wait: select failed, errno {}", sys::errno());
            sets.clear_readiness();
        }

        fusion.poll(sets, ret < 0);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{EventSource, SourceContext};
    use crate::sys::PollRequest;
    use hostloop_core::{BigLock, IoCondition};
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    struct Reader {
        fd: RawFd,
        hits: Arc<AtomicUsize>,
    }

    impl EventSource for Reader {
        fn query(&self, fds: &mut Vec<(RawFd, IoCondition)>) {
            fds.push((self.fd, IoCondition::IN));
        }
        fn check(&mut self, fds: &[PollRequest]) -> bool {
            !fds[0].revents.is_empty()
        }
        fn dispatch(&mut self) -> bool {
            let mut buf = [0u8; 8];
            unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            self.hits.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn test_zero_timeout_keeps_lock_and_returns() {
        let lock = BigLock::new();
        let mut guard = lock.lock();
        let mut fusion = EventSourceFusion::new(Arc::new(SourceContext::new()), 16);
        let mut sets = DescriptorSet::new();

        let start = Instant::now();
        let ret = SelectWait::new().wait(&mut fusion, &mut sets, Timeout::ZERO, &mut guard);
        assert_eq!(ret, 0);
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(lock.owns(&guard));
    }

    #[test]
    fn test_framework_source_wakes_and_dispatches() {
        let (r, w) = pipe();
        let ctx = Arc::new(SourceContext::new());
        let hits = Arc::new(AtomicUsize::new(0));
        ctx.attach(Box::new(Reader { fd: r, hits: Arc::clone(&hits) }), 0);
        let mut fusion = EventSourceFusion::new(ctx, 16);

        let lock = Arc::new(BigLock::new());
        let mut guard = lock.lock();

        let l = Arc::clone(&lock);
        let writer = std::thread::spawn(move || {
            // Only reachable while the waiter has released the lock
            let _g = l.lock();
            assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
            w
        });

        let mut sets = DescriptorSet::new();
        let ret = SelectWait::new().wait(&mut fusion, &mut sets, Timeout::from_millis(5000), &mut guard);
        assert_eq!(ret, 1);
        assert!(sets.read.contains(r));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(guard);
        let w = writer.join().unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
