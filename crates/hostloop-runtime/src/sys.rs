//! Thin syscall helpers shared by the wait paths

use std::os::unix::io::RawFd;

use hostloop_core::{IoCondition, Timeout};

use crate::fdset::DescriptorSet;

/// Last OS error number on this thread
#[inline]
pub(crate) fn errno() -> i32 {
    nix::errno::Errno::last_raw()
}

/// `select(2)` over `sets` with `timeout` (infinite = no deadline).
///
/// Returns the raw result: negative on error, 0 on timeout, otherwise the
/// number of ready descriptors. On return the sets hold observed readiness;
/// after an error their contents are unspecified.
pub(crate) fn select(sets: &mut DescriptorSet, timeout: Timeout) -> i32 {
    let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
    let tvp = match timeout.as_secs_micros() {
        Some((secs, micros)) => {
            tv.tv_sec = secs as libc::time_t;
            tv.tv_usec = micros as libc::suseconds_t;
            &mut tv as *mut libc::timeval
        }
        None => std::ptr::null_mut(),
    };
    // Safety: the three sets are valid fd_sets, tvp is null or points at tv
    unsafe {
        libc::select(
            sets.nfds(),
            sets.read.as_mut_ptr(),
            sets.write.as_mut_ptr(),
            sets.error.as_mut_ptr(),
            tvp,
        )
    }
}

/// One `poll(2)` entry: descriptor, interest, result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollRequest {
    pub fd: RawFd,
    pub events: IoCondition,
    pub revents: IoCondition,
}

impl PollRequest {
    #[inline]
    pub fn new(fd: RawFd, events: IoCondition) -> Self {
        Self { fd, events, revents: IoCondition::empty() }
    }
}

/// `poll(2)` over `reqs`, writing each entry's `revents`.
pub(crate) fn poll(reqs: &mut [PollRequest], timeout: Timeout) -> i32 {
    let mut raw: Vec<libc::pollfd> = reqs
        .iter()
        .map(|r| libc::pollfd {
            fd: r.fd,
            events: r.events.to_poll_events(),
            revents: 0,
        })
        .collect();
    // Safety: raw is a live array of raw.len() pollfds
    let ret = unsafe {
        libc::poll(raw.as_mut_ptr(), raw.len() as libc::nfds_t, timeout.as_poll_millis())
    };
    for (r, p) in reqs.iter_mut().zip(&raw) {
        r.revents = if ret > 0 {
            IoCondition::from_poll_events(p.revents)
        } else {
            IoCondition::empty()
        };
    }
    ret
}
