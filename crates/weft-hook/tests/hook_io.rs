//! End-to-end interception scenarios
//!
//! Each test drives real descriptors (socketpairs, loopback TCP) through
//! the exported shims from fibers spawned on a live reactor. The shims are
//! called through their crate paths so the scenarios hold regardless of
//! how the final link resolves the overriding symbols.

use std::ffi::{c_int, c_ulong, c_void};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_hook::fd_table::{self, SocketTimeout, NO_TIMEOUT};
use weft_hook::{set_hook_enable, shims};
use weft_reactor::reactor::Reactor;

fn socketpair() -> (c_int, c_int) {
    let mut fds = [0 as c_int; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

/// Kernel-truth F_GETFL, immune to symbol interposition
fn kernel_flags(fd: c_int) -> c_int {
    unsafe { libc::syscall(libc::SYS_fcntl, fd, libc::F_GETFL) as c_int }
}

/// Deregister and close a test descriptor
///
/// Removing the table entry before the close keeps later tests from
/// inheriting stale state when the kernel reuses the fd number.
fn cleanup(fd: c_int) {
    fd_table::remove(fd);
    unsafe { libc::close(fd) };
}

#[test]
fn test_passthrough_when_hook_disabled() {
    let (a, b) = socketpair();
    unsafe { libc::write(b, b"hello".as_ptr() as *const c_void, 5) };

    let mut buf = [0u8; 16];
    let n = unsafe { shims::recv(a, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");

    cleanup(a);
    cleanup(b);
}

#[test]
fn test_recv_suspends_until_peer_writes() {
    let reactor = Reactor::new("t-recv").unwrap();
    let (a, b) = socketpair();
    let got = Arc::new(AtomicI64::new(-2));

    let got2 = got.clone();
    let fiber = reactor.spawn(move || {
        set_hook_enable(true);
        fd_table::get_or_create(a);
        let mut buf = [0u8; 1024];
        let n = unsafe { shims::recv(a, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        assert_eq!(&buf[..n as usize], b"0123456789");
        got2.store(n as i64, Ordering::SeqCst);
    });

    // Nothing in the socket yet: the fiber must be parked, not erroring
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(got.load(Ordering::SeqCst), -2);

    unsafe { libc::write(b, b"0123456789".as_ptr() as *const c_void, 10) };
    fiber.join().unwrap();
    assert_eq!(got.load(Ordering::SeqCst), 10);

    cleanup(a);
    cleanup(b);
    reactor.shutdown();
}

#[test]
fn test_recv_timeout_surfaces_etimedout() {
    let reactor = Reactor::new("t-timeout").unwrap();
    let (a, b) = socketpair();
    let result = Arc::new(AtomicI64::new(0));
    let seen_errno = Arc::new(AtomicI32::new(0));
    let elapsed_ms = Arc::new(AtomicI64::new(0));

    let (r2, e2, t2) = (result.clone(), seen_errno.clone(), elapsed_ms.clone());
    let fiber = reactor.spawn(move || {
        set_hook_enable(true);
        fd_table::get_or_create(a);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 20_000,
        };
        let rc = unsafe {
            shims::setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(
            fd_table::get(a).unwrap().timeout_ms(SocketTimeout::Recv),
            20
        );

        let start = Instant::now();
        let mut buf = [0u8; 64];
        let n = unsafe { shims::recv(a, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        r2.store(n as i64, Ordering::SeqCst);
        e2.store(errno(), Ordering::SeqCst);
        t2.store(start.elapsed().as_millis() as i64, Ordering::SeqCst);
    });

    fiber.join().unwrap();
    assert_eq!(result.load(Ordering::SeqCst), -1);
    assert_eq!(seen_errno.load(Ordering::SeqCst), libc::ETIMEDOUT);
    let elapsed = elapsed_ms.load(Ordering::SeqCst);
    assert!(elapsed >= 15, "timed out too early: {}ms", elapsed);
    assert!(elapsed < 500, "timed out too late: {}ms", elapsed);

    cleanup(a);
    cleanup(b);
    reactor.shutdown();
}

#[test]
fn test_user_nonblock_gets_immediate_eagain() {
    let reactor = Reactor::new("t-nonblock").unwrap();
    let (a, b) = socketpair();
    let result = Arc::new(AtomicI64::new(0));
    let seen_errno = Arc::new(AtomicI32::new(0));
    let elapsed_ms = Arc::new(AtomicI64::new(i64::MAX));

    let (r2, e2, t2) = (result.clone(), seen_errno.clone(), elapsed_ms.clone());
    let fiber = reactor.spawn(move || {
        set_hook_enable(true);
        fd_table::get_or_create(a);

        let one: c_int = 1;
        let rc = unsafe {
            shims::ioctl(
                a,
                libc::FIONBIO as c_ulong,
                &one as *const c_int as *mut c_void,
            )
        };
        assert_eq!(rc, 0);

        let start = Instant::now();
        let mut buf = [0u8; 64];
        let n = unsafe { shims::recv(a, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        r2.store(n as i64, Ordering::SeqCst);
        e2.store(errno(), Ordering::SeqCst);
        t2.store(start.elapsed().as_millis() as i64, Ordering::SeqCst);
    });

    fiber.join().unwrap();
    assert_eq!(result.load(Ordering::SeqCst), -1);
    assert_eq!(seen_errno.load(Ordering::SeqCst), libc::EAGAIN);
    // Raw nonblocking semantics: no suspension happened
    assert!(elapsed_ms.load(Ordering::SeqCst) < 50);

    cleanup(a);
    cleanup(b);
    reactor.shutdown();
}

#[test]
fn test_fgetfl_reports_user_flag_not_kernel_flag() {
    let (a, b) = socketpair();
    fd_table::get_or_create(a);

    // The probe forced the kernel flag on, but the user never asked
    assert_ne!(kernel_flags(a) & libc::O_NONBLOCK, 0);
    let flags = unsafe { shims::fcntl(a, libc::F_GETFL, 0) };
    assert_eq!(flags & libc::O_NONBLOCK, 0);

    // User sets nonblock via F_SETFL: now visible
    let rc = unsafe { shims::fcntl(a, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long) };
    assert_eq!(rc, 0);
    let flags = unsafe { shims::fcntl(a, libc::F_GETFL, 0) };
    assert_ne!(flags & libc::O_NONBLOCK, 0);

    // User clears it: hidden again, kernel flag survives
    let rc = unsafe { shims::fcntl(a, libc::F_SETFL, (flags & !libc::O_NONBLOCK) as libc::c_long) };
    assert_eq!(rc, 0);
    let flags = unsafe { shims::fcntl(a, libc::F_GETFL, 0) };
    assert_eq!(flags & libc::O_NONBLOCK, 0);
    assert_ne!(kernel_flags(a) & libc::O_NONBLOCK, 0);

    cleanup(a);
    cleanup(b);
}

#[test]
fn test_fionbio_visible_through_fgetfl() {
    let (a, b) = socketpair();
    fd_table::get_or_create(a);

    let one: c_int = 1;
    let rc = unsafe {
        shims::ioctl(
            a,
            libc::FIONBIO as c_ulong,
            &one as *const c_int as *mut c_void,
        )
    };
    assert_eq!(rc, 0);
    let flags = unsafe { shims::fcntl(a, libc::F_GETFL, 0) };
    assert_ne!(flags & libc::O_NONBLOCK, 0);

    let zero: c_int = 0;
    let rc = unsafe {
        shims::ioctl(
            a,
            libc::FIONBIO as c_ulong,
            &zero as *const c_int as *mut c_void,
        )
    };
    assert_eq!(rc, 0);
    let flags = unsafe { shims::fcntl(a, libc::F_GETFL, 0) };
    assert_eq!(flags & libc::O_NONBLOCK, 0);
    // Clearing the user flag must not undo the forced kernel flag
    assert_ne!(kernel_flags(a) & libc::O_NONBLOCK, 0);

    cleanup(a);
    cleanup(b);
}

#[test]
fn test_zero_timeval_disables_timeout() {
    let reactor = Reactor::new("t-zerotv").unwrap();
    let (a, b) = socketpair();

    let fiber = reactor.spawn(move || {
        set_hook_enable(true);
        fd_table::get_or_create(a);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let rc = unsafe {
            shims::setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(
            fd_table::get(a).unwrap().timeout_ms(SocketTimeout::Recv),
            NO_TIMEOUT
        );
    });

    fiber.join().unwrap();
    cleanup(a);
    cleanup(b);
    reactor.shutdown();
}

#[test]
fn test_sleep_family_parks_fiber_while_others_progress() {
    let reactor = Reactor::new("t-sleep").unwrap();
    let progress = Arc::new(AtomicUsize::new(0));
    let slept_ms = Arc::new(AtomicI64::new(0));

    let p2 = progress.clone();
    let worker = reactor.spawn(move || {
        set_hook_enable(true);
        for _ in 0..5 {
            unsafe { shims::usleep(20_000) };
            p2.fetch_add(1, Ordering::SeqCst);
        }
    });

    let (p3, s2) = (progress.clone(), slept_ms.clone());
    let sleeper = reactor.spawn(move || {
        set_hook_enable(true);
        let start = Instant::now();
        unsafe { shims::usleep(150_000) };
        s2.store(start.elapsed().as_millis() as i64, Ordering::SeqCst);
        // The other fiber kept running while we were parked
        assert!(p3.load(Ordering::SeqCst) > 0);
    });

    worker.join().unwrap();
    sleeper.join().unwrap();
    let slept = slept_ms.load(Ordering::SeqCst);
    assert!(slept >= 140, "woke early: {}ms", slept);

    reactor.shutdown();
}

#[test]
fn test_nanosleep_leaves_rem_untouched() {
    let reactor = Reactor::new("t-nanosleep").unwrap();

    let fiber = reactor.spawn(|| {
        set_hook_enable(true);
        let req = libc::timespec {
            tv_sec: 0,
            tv_nsec: 50_000_000,
        };
        let mut rem = libc::timespec {
            tv_sec: 7,
            tv_nsec: 7,
        };
        let start = Instant::now();
        let rc = unsafe { shims::nanosleep(&req, &mut rem) };
        assert_eq!(rc, 0);
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert_eq!(rem.tv_sec, 7);
        assert_eq!(rem.tv_nsec, 7);
    });

    fiber.join().unwrap();
    reactor.shutdown();
}

#[test]
fn test_close_cancels_blocked_reader() {
    let reactor = Reactor::new("t-close").unwrap();
    let (a, b) = socketpair();
    let result = Arc::new(AtomicI64::new(-2));
    let seen_errno = Arc::new(AtomicI32::new(0));
    let close_rc = Arc::new(AtomicI32::new(-2));

    let (r2, e2) = (result.clone(), seen_errno.clone());
    let reader = reactor.spawn(move || {
        set_hook_enable(true);
        fd_table::get_or_create(a);
        let mut buf = [0u8; 64];
        let n = unsafe { shims::recv(a, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        r2.store(n as i64, Ordering::SeqCst);
        e2.store(errno(), Ordering::SeqCst);
    });

    let c2 = close_rc.clone();
    let closer = reactor.spawn(move || {
        // Give the reader time to park first
        std::thread::sleep(Duration::from_millis(50));
        set_hook_enable(true);
        c2.store(unsafe { shims::close(a) }, Ordering::SeqCst);
    });

    reader.join().unwrap();
    closer.join().unwrap();

    assert_eq!(result.load(Ordering::SeqCst), -1);
    assert_eq!(seen_errno.load(Ordering::SeqCst), libc::ECANCELED);
    assert_eq!(close_rc.load(Ordering::SeqCst), 0);

    cleanup(b);
    reactor.shutdown();
}

#[test]
fn test_socket_shim_registers_and_close_unregisters() {
    let reactor = Reactor::new("t-socket").unwrap();

    let fiber = reactor.spawn(|| {
        set_hook_enable(true);
        let fd = unsafe { shims::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let entry = fd_table::get(fd).expect("socket shim must register");
        assert!(entry.is_socket());
        assert!(entry.sys_nonblock());
        assert!(!entry.user_nonblock());
        assert_ne!(kernel_flags(fd) & libc::O_NONBLOCK, 0);

        assert_eq!(unsafe { shims::close(fd) }, 0);
        assert!(fd_table::get(fd).is_none());
        assert!(entry.is_closed());
    });

    fiber.join().unwrap();
    reactor.shutdown();
}

#[test]
fn test_loopback_echo_through_shims() {
    let reactor = Reactor::new("t-echo").unwrap();
    let port = Arc::new(AtomicU16::new(0));
    let echoed = Arc::new(AtomicI64::new(0));

    let p2 = port.clone();
    let server = reactor.spawn(move || {
        set_hook_enable(true);
        let ls = unsafe { shims::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(ls >= 0);

        let one: c_int = 1;
        unsafe {
            shims::setsockopt(
                ls,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const c_int as *const c_void,
                4,
            );
        }

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as u16;
        addr.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
        addr.sin_port = 0;
        let rc = unsafe {
            libc::bind(
                ls,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(unsafe { libc::listen(ls, 16) }, 0);

        let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        unsafe {
            libc::getsockname(
                ls,
                &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        p2.store(u16::from_be(bound.sin_port), Ordering::SeqCst);

        // Parks until the client arrives
        let conn = unsafe { shims::accept(ls, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert!(conn >= 0);
        assert!(fd_table::get(conn).is_some());

        let mut buf = [0u8; 16];
        let n = unsafe { shims::recv(conn, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"ping");
        let n = unsafe { shims::send(conn, b"pong".as_ptr() as *const c_void, 4, 0) };
        assert_eq!(n, 4);

        assert_eq!(unsafe { shims::close(conn) }, 0);
        assert_eq!(unsafe { shims::close(ls) }, 0);
    });

    let (p3, e2) = (port.clone(), echoed.clone());
    let client = reactor.spawn(move || {
        let target = loop {
            let p = p3.load(Ordering::SeqCst);
            if p != 0 {
                break p;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        set_hook_enable(true);
        let s = unsafe { shims::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(s >= 0);

        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as u16;
        addr.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
        addr.sin_port = target.to_be();
        let rc = unsafe {
            shims::connect(
                s,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0, "connect failed with errno {}", errno());

        let n = unsafe { shims::send(s, b"ping".as_ptr() as *const c_void, 4, 0) };
        assert_eq!(n, 4);
        let mut buf = [0u8; 16];
        let n = unsafe { shims::recv(s, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"pong");
        e2.store(1, Ordering::SeqCst);

        assert_eq!(unsafe { shims::close(s) }, 0);
    });

    server.join().unwrap();
    client.join().unwrap();
    assert_eq!(echoed.load(Ordering::SeqCst), 1);
    reactor.shutdown();
}
