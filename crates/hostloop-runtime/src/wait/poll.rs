//! Handle-polling wait
//!
//! Order of one step:
//!
//! 1. Polling callbacks. A nonzero result ends the step immediately with
//!    that value; the descriptor sets are emptied.
//! 2. Framework prepare/query, then wait objects and notification
//!    descriptors are appended to the same request array.
//! 3. `poll(2)` with the lock released, bounded by the caller's timeout
//!    tightened by the framework's.
//! 4. Signaled wait objects run, then the framework checks and dispatches.
//!    Notification descriptors reported invalid are unregistered.
//! 5. A zero-timeout `select(2)` sweeps the descriptor sets. Readiness seen
//!    here makes the next step's wait non-blocking.

use std::sync::Arc;

use hostloop_core::{effective_timeout, kdebug, BigLockGuard, IoCondition, Timeout};

use super::{HandleRegistry, HostWait};
use crate::fdset::DescriptorSet;
use crate::source::EventSourceFusion;
use crate::sys;

pub struct HandlePollWait {
    handles: Arc<HandleRegistry>,
    /// Readiness left over from the last sweep
    carry_zero_timeout: bool,
}

impl HandlePollWait {
    pub fn new(handles: Arc<HandleRegistry>) -> Self {
        Self {
            handles,
            carry_zero_timeout: false,
        }
    }

    #[inline]
    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }
}

/// Combined result of the handle poll and the descriptor sweep
fn combine(poll_ret: i32, select_ret: i32) -> i32 {
    if poll_ret > 0 || select_ret > 0 {
        1
    } else if poll_ret < 0 {
        poll_ret
    } else {
        0
    }
}

impl HostWait for HandlePollWait {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn wait(
        &mut self,
        fusion: &mut EventSourceFusion,
        sets: &mut DescriptorSet,
        timeout: Timeout,
        guard: &mut BigLockGuard<'_>,
    ) -> i32 {
        let polled = self.handles.polling.run_all();
        if polled != 0 {
            sets.clear_readiness();
            return polled;
        }

        let framework_ms = fusion.query();
        let n_framework = fusion.requests().len();
        let n_objects = self.handles.wait_objects.append_requests(fusion.requests_mut());
        let notify_fds = self.handles.notify_fds();
        for &fd in &notify_fds {
            fusion.requests_mut().push(fd, IoCondition::IN | IoCondition::PRI);
        }

        let mut timeout = effective_timeout(timeout, framework_ms);
        if std::mem::take(&mut self.carry_zero_timeout) {
            timeout = Timeout::ZERO;
        }

        let reqs = fusion.requests_mut().as_mut_slice();
        let poll_ret = if timeout.is_zero() {
            sys::poll(reqs, timeout)
        } else {
            guard.unlocked(|| sys::poll(reqs, timeout))
        };
        if poll_ret < 0 {
            kdebug!("wait: poll failed, errno {}", sys::errno());
        }

        if poll_ret > 0 {
            let n_handles = n_framework + n_objects;
            let stale: Vec<_> = fusion.requests().as_slice()[n_handles..n_handles + notify_fds.len()]
                .iter()
                .filter(|req| req.revents.contains(IoCondition::NVAL))
                .map(|req| req.fd)
                .collect();
            // A closed descriptor would report NVAL forever
            for fd in stale {
                kdebug!("wait: dropping closed notification fd {}", fd);
                self.handles.fd_unregister(fd);
            }

            if n_objects > 0 {
                let results = &fusion.requests().as_slice()[n_framework..n_handles];
                self.handles.wait_objects.set_results(results);
                self.handles.wait_objects.dispatch();
            }
        }

        fusion.requests_mut().truncate(n_framework);
        fusion.dispatch_ready();

        let mut select_ret = 0;
        if sets.is_empty() {
            sets.clear_readiness();
        } else {
            select_ret = sys::select(sets, Timeout::ZERO);
            if select_ret < 0 {
                kdebug!("wait: sweep select failed, errno {}", sys::errno());
                sets.clear_readiness();
            } else if select_ret > 0 {
                self.carry_zero_timeout = true;
            }
        }

        combine(poll_ret, select_ret)
    }
}
