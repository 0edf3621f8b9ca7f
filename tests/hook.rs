use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use mini_coroutine_runtime::hook::{self, FdManager};
use mini_coroutine_runtime::{Event, IoManager, Scheduler};
use nix::fcntl::{FcntlArg, OFlag};
use socket2::{Domain, SockAddr, Socket, Type};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Connected unix stream pair, both ends tracked by the hook layer.
fn tracked_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let res = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(res, 0, "socketpair() failed");
    for &fd in &fds {
        FdManager::remove(fd);
        assert!(FdManager::get(fd, true).unwrap().is_socket());
    }
    (fds[0], fds[1])
}

fn release(fd: RawFd) {
    FdManager::remove(fd);
    unsafe {
        libc::close(fd);
    }
}

fn wait_parked(iom: &IoManager, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while iom.pending_events() < count {
        assert!(Instant::now() < deadline, "coroutine never parked");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn sleeps_overlap_on_one_worker() {
    init_log();
    let iom = IoManager::new(1, false, "sleep").unwrap();
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    for _ in 0..2 {
        let tx = tx.clone();
        iom.schedule(move || {
            hook::usleep(100_000);
            tx.send(Instant::now()).unwrap();
        });
    }
    for _ in 0..2 {
        let woke = rx.recv_timeout(Duration::from_secs(5)).unwrap() - start;
        assert!(woke >= Duration::from_millis(95), "woke early: {:?}", woke);
        assert!(woke < Duration::from_millis(190), "sleeps ran back to back: {:?}", woke);
    }
    iom.stop();
}

#[test]
fn read_times_out() {
    init_log();
    let iom = IoManager::new(2, false, "timeout").unwrap();
    let (a, b) = tracked_pair();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        hook::set_timeout(a, Event::Read, Some(Duration::from_millis(50))).unwrap();
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let res = hook::read(a, &mut buf);
        tx.send((res.map_err(|e| e.kind()), start.elapsed())).unwrap();
    });

    let (res, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(res, Err(io::ErrorKind::TimedOut));
    assert!(elapsed >= Duration::from_millis(45), "timed out early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "timed out late: {:?}", elapsed);
    assert_eq!(iom.pending_events(), 0);

    iom.stop();
    release(a);
    release(b);
}

#[test]
fn cancelled_read_reports_ecanceled() {
    init_log();
    let iom = IoManager::new(2, false, "cancelled").unwrap();
    let (a, b) = tracked_pair();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        hook::set_timeout(a, Event::Read, Some(Duration::from_secs(10))).unwrap();
        let mut buf = [0u8; 16];
        tx.send(hook::read(a, &mut buf).map_err(|e| e.raw_os_error()))
            .unwrap();
    });

    wait_parked(&iom, 1);
    assert!(iom.cancel_event(a, Event::Read));
    let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(res, Err(Some(libc::ECANCELED)));

    iom.stop();
    release(a);
    release(b);
}

#[test]
fn read_resumes_when_data_arrives() {
    init_log();
    let iom = IoManager::new(2, false, "data").unwrap();
    let (a, b) = tracked_pair();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let mut buf = [0u8; 16];
        let n = hook::read(a, &mut buf).unwrap();
        let sent = hook::write(a, &buf[..n]).unwrap();
        tx.send((buf[..n].to_vec(), sent)).unwrap();
    });

    wait_parked(&iom, 1);
    assert_eq!(unsafe { libc::write(b, b"hello".as_ptr().cast(), 5) }, 5);
    let (got, sent) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, b"hello");
    assert_eq!(sent, 5);

    let mut echo = [0u8; 8];
    assert_eq!(unsafe { libc::read(b, echo.as_mut_ptr().cast(), 8) }, 5);
    assert_eq!(&echo[..5], b"hello");

    iom.stop();
    release(a);
    release(b);
}

#[test]
fn connect_to_closed_port_fails_and_close_forgets_the_fd() {
    init_log();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let iom = IoManager::new(2, false, "connect").unwrap();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let fd = hook::socket(Domain::IPV4, Type::STREAM, None).unwrap();
        let tracked = FdManager::get(fd, false).map_or(false, |m| m.is_socket());
        let addr = SockAddr::from(port);
        let res = hook::connect_with_timeout(fd, &addr, Some(Duration::from_millis(100)));
        hook::close(fd).unwrap();
        let forgotten = FdManager::get(fd, false).is_none();
        tx.send((tracked, res.is_err(), forgotten)).unwrap();
    });

    let (tracked, failed, forgotten) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(tracked);
    assert!(failed);
    assert!(forgotten);
    assert_eq!(iom.pending_events(), 0);
    iom.stop();
}

#[test]
fn untracked_socket_connects_from_a_worker() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = SockAddr::from(listener.local_addr().unwrap());
    let iom = IoManager::new(2, false, "untracked").unwrap();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let fd = Socket::new(Domain::IPV4, Type::STREAM, None)
            .unwrap()
            .into_raw_fd();
        FdManager::remove(fd);
        let res = hook::connect(fd, &addr).map_err(|e| e.raw_os_error());
        let untracked = FdManager::get(fd, false).is_none();
        release(fd);
        tx.send((res, untracked)).unwrap();
    });

    let (res, untracked) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(res, Ok(()));
    assert!(untracked);
    let _ = listener.accept().unwrap();
    iom.stop();
}

#[test]
fn connect_times_out_against_a_full_backlog() {
    init_log();
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    listener.bind(&any.into()).unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();

    // the first connection fills the accept queue, later handshakes get dropped
    let mut fillers = Vec::new();
    for _ in 0..2 {
        let filler = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        filler.set_nonblocking(true).unwrap();
        let _ = filler.connect(&addr);
        fillers.push(filler);
    }
    std::thread::sleep(Duration::from_millis(20));

    let iom = IoManager::new(2, false, "connect-timeout").unwrap();
    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let fd = hook::socket(Domain::IPV4, Type::STREAM, None).unwrap();
        let start = Instant::now();
        let res = hook::connect_with_timeout(fd, &addr, Some(Duration::from_millis(100)));
        let elapsed = start.elapsed();
        hook::close(fd).unwrap();
        tx.send((res.map_err(|e| e.kind()), elapsed)).unwrap();
    });

    let (res, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(res, Err(io::ErrorKind::TimedOut));
    assert!(elapsed >= Duration::from_millis(95), "timed out early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "timed out late: {:?}", elapsed);
    assert_eq!(iom.pending_events(), 0);
    iom.stop();
    drop(fillers);
}

#[test]
fn blocking_socket_blocks_the_thread_without_a_reactor() {
    init_log();
    let sched = Scheduler::new(1, false, "plain-io");
    sched.start().unwrap();
    let (a, b) = tracked_pair();

    let (tx, rx) = mpsc::channel();
    sched.schedule(move || {
        assert!(hook::is_enabled());
        let mut buf = [0u8; 16];
        hook::set_timeout(a, Event::Read, Some(Duration::from_millis(50))).unwrap();
        let res = hook::read(a, &mut buf).map(|n| buf[..n].to_vec());
        tx.send(res.map_err(|e| e.kind())).unwrap();

        hook::set_timeout(a, Event::Read, None).unwrap();
        let res = hook::read(a, &mut buf).map(|n| buf[..n].to_vec());
        tx.send(res.map_err(|e| e.kind())).unwrap();
    });

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, Err(io::ErrorKind::TimedOut));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(unsafe { libc::write(b, b"ping".as_ptr().cast(), 4) }, 4);
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(second, Ok(b"ping".to_vec()));

    sched.stop();
    release(a);
    release(b);
}

#[test]
fn user_nonblocking_is_honored() {
    init_log();
    let iom = IoManager::new(1, false, "nonblock").unwrap();
    let (a, b) = tracked_pair();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let getfl = |fd| OFlag::from_bits_truncate(hook::fcntl(fd, FcntlArg::F_GETFL).unwrap());
        let before = getfl(a).contains(OFlag::O_NONBLOCK);

        hook::fcntl(a, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();
        let mut buf = [0u8; 4];
        let kind = hook::read(a, &mut buf).unwrap_err().kind();
        let during = getfl(a).contains(OFlag::O_NONBLOCK);

        hook::fcntl(a, FcntlArg::F_SETFL(OFlag::empty())).unwrap();
        let after = getfl(a).contains(OFlag::O_NONBLOCK);
        let real = OFlag::from_bits_truncate(nix::fcntl::fcntl(a, FcntlArg::F_GETFL).unwrap());
        tx.send((before, kind, during, after, real.contains(OFlag::O_NONBLOCK)))
            .unwrap();
    });

    let (before, kind, during, after, real) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!before);
    assert_eq!(kind, io::ErrorKind::WouldBlock);
    assert!(during);
    assert!(!after);
    assert!(real);

    iom.stop();
    release(a);
    release(b);
}

#[test]
fn fionbio_only_changes_the_user_view() {
    init_log();
    let iom = IoManager::new(1, false, "fionbio").unwrap();
    let (a, b) = tracked_pair();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let set = |mut value: libc::c_int| unsafe {
            let arg = (&mut value as *mut libc::c_int).cast();
            hook::ioctl(a, libc::FIONBIO as libc::c_ulong, arg).unwrap();
        };
        set(0);
        let meta = FdManager::get(a, false).unwrap();
        let real = OFlag::from_bits_truncate(nix::fcntl::fcntl(a, FcntlArg::F_GETFL).unwrap());
        let user_off = !meta.user_nonblock();

        set(1);
        tx.send((user_off, meta.user_nonblock(), real.contains(OFlag::O_NONBLOCK)))
            .unwrap();
    });

    let (user_off, user_on, real) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(user_off);
    assert!(user_on);
    assert!(real);

    iom.stop();
    release(a);
    release(b);
}

#[test]
fn close_wakes_blocked_reader() {
    init_log();
    let iom = IoManager::new(2, false, "close").unwrap();
    let (a, b) = tracked_pair();

    let (tx, rx) = mpsc::channel();
    iom.schedule(move || {
        let mut buf = [0u8; 4];
        tx.send(hook::read(a, &mut buf).map_err(|e| e.raw_os_error()))
            .unwrap();
    });

    wait_parked(&iom, 1);
    iom.schedule(move || hook::close(a).unwrap());
    let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(res, Err(Some(libc::EBADF)));
    assert_eq!(iom.pending_events(), 0);

    iom.stop();
    release(b);
}
