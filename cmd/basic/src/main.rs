//! Basic hostloop example
//!
//! Drives the main loop with a device descriptor fed by a worker thread, a
//! periodic timer and a bottom half, then exits after a fixed number of
//! device reads.
//!
//! # Environment Variables
//!
//! - `HOSTLOOP_WAIT_BACKEND=poll` - Use the handle-polling wait
//! - `HOSTLOOP_ALARM=timerfd` - Wake timers through a timerfd
//! - `HOSTLOOP_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use hostloop::{init_main_loop, iothread_lock, main_loop_wait, notify_event, set_fd_handler, timer_new};
use hostloop::{bh_new, kdebug, kinfo, ClockType, MainLoopConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MESSAGES: usize = 5;

// HOSTLOOP_LOG_LEVEL=debug cargo run -p hostloop-basic
fn main() {
    println!("=== hostloop Basic Example ===\n");

    MainLoopConfig::from_env().print();
    if init_main_loop() < 0 {
        eprintln!("init_main_loop failed");
        std::process::exit(1);
    }

    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        eprintln!("pipe failed");
        std::process::exit(1);
    }
    let (rfd, wfd) = (fds[0], fds[1]);

    // Device side: count bytes as they arrive
    let received = Arc::new(AtomicUsize::new(0));
    let r = received.clone();
    set_fd_handler(
        rfd,
        Some(Box::new(move || {
            let mut buf = [0u8; 64];
            let n = unsafe { libc::read(rfd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n > 0 {
                r.fetch_add(n as usize, Ordering::SeqCst);
                kdebug!("[device] read {} byte(s)", n);
            }
        })),
        None,
    )
    .expect("main loop initialized");

    // Periodic timer re-arming itself from its own callback
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let tick = Arc::new(std::sync::OnceLock::<hostloop::Timer>::new());
    let rearm = tick.clone();
    let timer = timer_new(ClockType::Realtime, move || {
        t.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = rearm.get() {
            timer.modify_in(Duration::from_millis(20));
        }
    })
    .expect("main loop initialized");
    timer.modify_in(Duration::from_millis(20));
    let _ = tick.set(timer);

    // Bottom half scheduled from the worker
    let bh_runs = Arc::new(AtomicUsize::new(0));
    let b = bh_runs.clone();
    let bh = Arc::new(
        bh_new(move || {
            b.fetch_add(1, Ordering::SeqCst);
        })
        .expect("main loop initialized"),
    );

    let worker_bh = bh.clone();
    let worker = std::thread::spawn(move || {
        for i in 0..MESSAGES {
            std::thread::sleep(Duration::from_millis(30));
            unsafe { libc::write(wfd, b"x".as_ptr() as *const _, 1) };
            worker_bh.schedule();
            kdebug!("[worker] message {}", i);
        }
        notify_event();
    });

    let start = Instant::now();
    let mut guard = iothread_lock();
    let mut iterations = 0u64;
    while received.load(Ordering::SeqCst) < MESSAGES && start.elapsed() < Duration::from_secs(10) {
        main_loop_wait(&mut guard, false);
        iterations += 1;
    }
    drop(guard);
    worker.join().expect("worker panicked");

    kinfo!(
        "{} bytes, {} ticks, {} bottom halves in {} iterations ({:?})",
        received.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst),
        bh_runs.load(Ordering::SeqCst),
        iterations,
        start.elapsed()
    );

    set_fd_handler(rfd, None, None).expect("main loop initialized");
    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }

    println!("\n=== Example Complete ===");
}
