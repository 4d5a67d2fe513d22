//! Timers fire through repeated main loop iterations, select wait.

mod common;

use hostloop::{AlarmKind, MainLoopConfig, WaitBackendKind};

#[test]
fn test_timers_fire_once_in_deadline_order() {
    common::timers_fire_once_in_deadline_order(
        MainLoopConfig::new().wait_backend(WaitBackendKind::Select).alarm(AlarmKind::Deadline),
    );
}
