//! Cross-thread wakeup of a blocked main loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hostloop::{init_main_loop_with, iothread_lock, main_loop_wait, notify_event, MainLoopConfig};

#[test]
fn test_notify_wakes_blocked_wait() {
    assert_eq!(init_main_loop_with(MainLoopConfig::new().bridge_signals(false)), 0);

    // A timer far in the future bounds the wait at 60s
    let far = hostloop::timer_new(hostloop::ClockType::Host, || {}).unwrap();
    far.modify_in(Duration::from_secs(60));

    let sent = Arc::new(AtomicBool::new(false));
    let s = Arc::clone(&sent);
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        s.store(true, Ordering::SeqCst);
        notify_event();
    });

    let mut guard = iothread_lock();
    let start = Instant::now();
    while !sent.load(Ordering::SeqCst) {
        main_loop_wait(&mut guard, false);
    }
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(far.is_pending());

    drop(guard);
    waker.join().unwrap();
}
