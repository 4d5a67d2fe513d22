//! Timers fire through repeated main loop iterations, handle-polling wait.
//!
//! The timerfd alarm is only seen if the handle wait polls its descriptor.

mod common;

use hostloop::{AlarmKind, MainLoopConfig, WaitBackendKind};

#[test]
fn test_timers_fire_once_in_deadline_order() {
    common::timers_fire_once_in_deadline_order(
        MainLoopConfig::new().wait_backend(WaitBackendKind::HandlePoll).alarm(AlarmKind::TimerFd),
    );
}
