//! Scenarios shared by the per-backend test binaries.
//!
//! Each test binary owns one global loop, so a backend is chosen per file
//! and the scenario body lives here.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hostloop::{
    init_main_loop_with, iothread_lock, main_loop_wait, set_signal_handler, timer_new, ClockType,
    MainLoopConfig, Signal, SignalHandler,
};

pub fn timers_fire_once_in_deadline_order(config: MainLoopConfig) {
    assert_eq!(init_main_loop_with(config.bridge_signals(false)), 0);

    let fired = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&fired);
    let late = timer_new(ClockType::Realtime, move || f.lock().unwrap().push("late")).unwrap();
    let f = Arc::clone(&fired);
    let early = timer_new(ClockType::Realtime, move || f.lock().unwrap().push("early")).unwrap();

    // Armed in reverse so order comes from deadlines, not registration
    let start = Instant::now();
    late.modify_in(Duration::from_millis(50));
    early.modify_in(Duration::ZERO);

    let mut guard = iothread_lock();
    let deadline = start + Duration::from_secs(5);
    while fired.lock().unwrap().len() < 2 && Instant::now() < deadline {
        main_loop_wait(&mut guard, false);
    }
    let elapsed = start.elapsed();
    for _ in 0..3 {
        main_loop_wait(&mut guard, true);
    }
    drop(guard);

    assert_eq!(*fired.lock().unwrap(), vec!["early", "late"]);
    assert!(elapsed >= Duration::from_millis(45), "late timer fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "late timer fired after {:?}", elapsed);
    assert!(!early.is_pending());
    assert!(!late.is_pending());
}

fn raise(signal: Signal) {
    assert_eq!(unsafe { libc::pthread_kill(libc::pthread_self(), signal as libc::c_int) }, 0);
}

/// Initialization blocks the bridged signals on the calling thread, so the
/// whole scenario runs on one test thread.
pub fn each_signal_reaches_handler(config: MainLoopConfig) {
    assert_eq!(init_main_loop_with(config.bridge_signals(true)), 0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    assert!(!set_signal_handler(Signal::SIGALRM, SignalHandler::basic(move |sig| {
        s.lock().unwrap().push(sig);
    }))
    .unwrap());

    let infos = Arc::new(Mutex::new(Vec::new()));
    let i = Arc::clone(&infos);
    set_signal_handler(Signal::SIGIO, SignalHandler::extended(move |_, info| {
        i.lock().unwrap().push(info.signo());
    }))
    .unwrap();

    const N: usize = 5;
    let mut guard = iothread_lock();
    for _ in 0..N {
        // One at a time: pending standard signals coalesce
        raise(Signal::SIGALRM);
        main_loop_wait(&mut guard, false);
    }
    raise(Signal::SIGIO);
    main_loop_wait(&mut guard, false);
    drop(guard);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), N);
    assert!(seen.iter().all(|&s| s == Signal::SIGALRM));
    assert_eq!(*infos.lock().unwrap(), vec![libc::SIGIO]);
}
