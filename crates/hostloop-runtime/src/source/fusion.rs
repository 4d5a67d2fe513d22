//! Fold the event-source framework into a descriptor-set wait
//!
//! `fill` runs prepare/query and merges the pending requests into the
//! caller's [`DescriptorSet`], tightening the timeout with the framework's.
//! `poll` copies observed readiness back and runs check/dispatch.

use std::sync::Arc;

use hostloop_core::constants::PRIORITY_NONE;
use hostloop_core::{IoCondition, Timeout};

use super::{PollRequestArray, SourceContext};
use crate::fdset::DescriptorSet;

/// Interest bits that map onto the three `select(2)` sets
const SELECTABLE: IoCondition = IoCondition::IN.union(IoCondition::OUT).union(IoCondition::ERR);

pub struct EventSourceFusion {
    context: Arc<SourceContext>,
    fds: PollRequestArray,
    max_priority: i32,
}

impl EventSourceFusion {
    pub fn new(context: Arc<SourceContext>, capacity: usize) -> Self {
        Self {
            context,
            fds: PollRequestArray::with_capacity(capacity),
            max_priority: PRIORITY_NONE,
        }
    }

    #[inline]
    pub fn context(&self) -> &Arc<SourceContext> {
        &self.context
    }

    /// Run prepare and query into the internal array.
    /// Returns the framework timeout in milliseconds (-1 for none).
    pub fn query(&mut self) -> i32 {
        let prepared = self.context.prepare();
        self.max_priority = prepared.max_priority;
        self.fds.clear();
        self.context.query(self.max_priority, &mut self.fds);
        prepared.timeout_ms
    }

    /// Merge pending framework requests into `sets` and tighten `timeout`.
    pub fn fill(&mut self, sets: &mut DescriptorSet, timeout: &mut Timeout) {
        let framework_ms = self.query();
        for req in self.fds.iter() {
            sets.add(req.fd, req.events & SELECTABLE);
        }
        timeout.tighten_framework(framework_ms);
    }

    /// Copy observed readiness back and dispatch. After a failed wait the
    /// sets are not consulted and every request reports nothing.
    pub fn poll(&mut self, sets: &DescriptorSet, had_error: bool) {
        for req in self.fds.iter_mut() {
            req.revents = if had_error {
                IoCondition::empty()
            } else {
                req.events & sets.observed(req.fd)
            };
        }
        self.dispatch_ready();
    }

    /// Check the current array and dispatch whatever became ready.
    pub fn dispatch_ready(&mut self) -> bool {
        let ready = self.context.check(self.max_priority, &self.fds);
        if ready {
            self.context.dispatch();
        }
        ready
    }

    /// Requests from the last `query`, for waits that poll them directly
    #[inline]
    pub fn requests(&self) -> &PollRequestArray {
        &self.fds
    }

    #[inline]
    pub fn requests_mut(&mut self) -> &mut PollRequestArray {
        &mut self.fds
    }
}

impl std::fmt::Debug for EventSourceFusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourceFusion")
            .field("pending", &self.fds.len())
            .field("max_priority", &self.max_priority)
            .finish()
    }
}
