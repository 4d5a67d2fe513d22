//! Blocking wait coordination
//!
//! One blocking step per main loop iteration, with the global execution lock
//! released while the thread is actually blocked. Two implementations:
//!
//! - [`SelectWait`]: framework requests are folded into the descriptor sets
//!   and a single `select(2)` waits on everything.
//! - [`HandlePollWait`]: polling callbacks, framework requests, wait objects
//!   and notification descriptors go through `poll(2)`; the descriptor sets
//!   are then swept with a zero-timeout `select(2)`.
//!
//! Both return the raw wait result: negative on failure, 0 when nothing is
//! ready, positive otherwise. On return `sets` holds observed readiness, or
//! is empty if no readiness information is available.

mod select;
mod poll;
pub mod registry;

pub use select::SelectWait;
pub use poll::HandlePollWait;
pub use registry::{
    HandleRegistry, PollingFunc, PollingRegistry, PollingToken, WaitObjectFunc, WaitObjectTable,
};

use std::sync::Arc;

use hostloop_core::{BigLockGuard, Timeout};

use crate::config::WaitBackendKind;
use crate::fdset::DescriptorSet;
use crate::source::EventSourceFusion;

/// The blocking step of one iteration
pub trait HostWait: Send {
    fn name(&self) -> &'static str;

    /// Wait on `sets` and the framework for at most `timeout`, then run the
    /// framework's check and dispatch. `guard` is released while blocked.
    fn wait(
        &mut self,
        fusion: &mut EventSourceFusion,
        sets: &mut DescriptorSet,
        timeout: Timeout,
        guard: &mut BigLockGuard<'_>,
    ) -> i32;
}

/// Create the configured wait implementation
pub fn new_host_wait(kind: WaitBackendKind, handles: &Arc<HandleRegistry>) -> Box<dyn HostWait> {
    match kind {
        WaitBackendKind::Select => Box::new(SelectWait::new()),
        WaitBackendKind::HandlePoll => Box::new(HandlePollWait::new(Arc::clone(handles))),
    }
}
