//! Polling callbacks and wait objects under the handle-polling wait.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hostloop::{
    add_polling_cb, add_wait_object, del_polling_cb, del_wait_object, fd_register, fd_unregister,
    iothread_lock, main_loop_shared, main_loop_wait, notify_event, LoopError, MainLoopConfig,
    WaitBackendKind,
};

const MAX_OBJECTS: usize = 4;

static SERIAL: Mutex<()> = Mutex::new(());

fn setup() -> MutexGuard<'static, ()> {
    let serial = SERIAL.lock().unwrap_or_else(|p| p.into_inner());
    let config = MainLoopConfig::new()
        .bridge_signals(false)
        .wait_backend(WaitBackendKind::HandlePoll)
        .max_wait_objects(MAX_OBJECTS);
    match hostloop::try_init_main_loop(config) {
        Ok(()) | Err(LoopError::AlreadyInitialized) => {}
        Err(e) => panic!("init failed: {}", e),
    }
    serial
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

#[test]
fn test_polling_membership_keeps_order() {
    let _serial = setup();
    let shared = main_loop_shared().unwrap();

    let tokens: Vec<_> = (0..5).map(|_| add_polling_cb(Box::new(|| 0)).unwrap()).collect();
    assert!(del_polling_cb(tokens[1]));
    assert!(del_polling_cb(tokens[3]));
    assert_eq!(shared.handles.polling.tokens(), vec![tokens[0], tokens[2], tokens[4]]);

    // Absent token: no error, nothing changes
    assert!(!del_polling_cb(tokens[1]));
    assert_eq!(shared.handles.polling.tokens(), vec![tokens[0], tokens[2], tokens[4]]);

    for t in [tokens[0], tokens[2], tokens[4]] {
        assert!(del_polling_cb(t));
    }
    assert!(shared.handles.polling.is_empty());
}

#[test]
fn test_wait_object_capacity_and_removal() {
    let _serial = setup();
    let shared = main_loop_shared().unwrap();

    let handles: Vec<RawFd> = (100..100 + MAX_OBJECTS as RawFd).collect();
    for &h in &handles {
        add_wait_object(h, None).unwrap();
    }
    let before = shared.handles.wait_objects.handles();
    assert_eq!(before, handles);

    let err = add_wait_object(500, None).unwrap_err();
    assert!(matches!(err, LoopError::CapacityExceeded { capacity: MAX_OBJECTS, .. }));
    assert_eq!(shared.handles.wait_objects.handles(), before);

    assert!(!del_wait_object(999));
    assert_eq!(shared.handles.wait_objects.handles(), before);

    assert!(del_wait_object(handles[1]));
    assert_eq!(
        shared.handles.wait_objects.handles(),
        vec![handles[0], handles[2], handles[3]]
    );
    for h in [handles[0], handles[2], handles[3]] {
        assert!(del_wait_object(h));
    }
    assert!(shared.handles.wait_objects.is_empty());
}

#[test]
fn test_polling_callback_result_is_returned() {
    let _serial = setup();
    let token = add_polling_cb(Box::new(|| 3)).unwrap();

    let mut guard = iothread_lock();
    let start = Instant::now();
    assert_eq!(main_loop_wait(&mut guard, false), 3);
    assert!(start.elapsed() < Duration::from_millis(500));
    drop(guard);

    assert!(del_polling_cb(token));
}

#[test]
fn test_signaled_wait_object_runs_callback() {
    let _serial = setup();
    let (r, w) = pipe();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    add_wait_object(
        r,
        Some(Box::new(move || {
            let mut buf = [0u8; 8];
            unsafe { libc::read(r, buf.as_mut_ptr() as *mut _, buf.len()) };
            h.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
    let mut guard = iothread_lock();
    let deadline = Instant::now() + Duration::from_secs(5);
    while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        main_loop_wait(&mut guard, false);
    }
    main_loop_wait(&mut guard, true);
    drop(guard);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(del_wait_object(r));
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

#[test]
fn test_nonblocking_wait_leaves_registries_alone() {
    let _serial = setup();
    let shared = main_loop_shared().unwrap();
    let polling = shared.handles.polling.tokens();
    let objects = shared.handles.wait_objects.handles();
    let handlers = shared.iohandlers.len();

    let mut guard = iothread_lock();
    let start = Instant::now();
    main_loop_wait(&mut guard, true);
    assert!(start.elapsed() < Duration::from_millis(100));
    drop(guard);

    assert_eq!(shared.handles.polling.tokens(), polling);
    assert_eq!(shared.handles.wait_objects.handles(), objects);
    assert_eq!(shared.iohandlers.len(), handlers);
}

#[test]
fn test_fd_registration_round_trip() {
    let _serial = setup();
    let shared = main_loop_shared().unwrap();
    let (r, w) = pipe();

    fd_register(r).unwrap();
    assert!(shared.handles.notify_fds().contains(&r));
    assert!(fd_unregister(r));
    assert!(!shared.handles.notify_fds().contains(&r));
    assert!(!fd_unregister(r));

    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

#[test]
fn test_closed_registered_fd_does_not_spin_loop() {
    let _serial = setup();
    let shared = main_loop_shared().unwrap();
    let (r, w) = pipe();
    let fd = unsafe { libc::dup2(r, 901) };
    assert_eq!(fd, 901);
    fd_register(fd).unwrap();
    unsafe {
        libc::close(fd);
        libc::close(r);
        libc::close(w);
    }

    let mut guard = iothread_lock();
    main_loop_wait(&mut guard, true);
    main_loop_wait(&mut guard, true);
    assert!(!shared.handles.notify_fds().contains(&fd));

    // Only the delayed notification can end this wait now
    let waker = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(150));
        notify_event();
    });
    let start = Instant::now();
    main_loop_wait(&mut guard, false);
    let elapsed = start.elapsed();
    drop(guard);
    waker.join().unwrap();

    assert!(elapsed >= Duration::from_millis(120), "woke after {:?}", elapsed);
    assert!(!fd_unregister(fd));
}
