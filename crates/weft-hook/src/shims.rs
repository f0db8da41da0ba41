//! The exported symbols
//!
//! One `#[no_mangle] extern "C"` definition per intercepted libc entry
//! point, matching the POSIX signatures exactly. When these are linked
//! ahead of libc (static link order or LD_PRELOAD), all process I/O funnels
//! through here; each shim consults the per-thread switch and the
//! descriptor table, then either passes straight through to the origin slot
//! or runs the cooperative transform.
//!
//! `fcntl` is exported with a fixed third argument and re-extracts it per
//! command (int, pointer, or absent) before forwarding through the
//! C-variadic origin slot — the variadic contract differs by command and
//! forwarding the wrong width passes undefined bits.

use std::ffi::{c_int, c_long, c_uint, c_ulong, c_void};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use libc::{
    iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, timeval, useconds_t,
};

use weft_core::errno::{errno, set_errno};
use weft_core::winfo;
use weft_reactor::{fiber, reactor::Reactor, IoEvent, WaitToken};

use crate::config;
use crate::enable::is_hook_enable;
use crate::fd_table::{self, SocketTimeout, NO_TIMEOUT};
use crate::io::{do_io, suspend};
use crate::origin;

// This vendored `libc` does not expose these Linux fcntl ABI items on the
// generic linux target; the values/layout are fixed by the kernel uapi
// (`asm-generic/fcntl.h`), so they're reproduced here rather than pulled in.
mod libc_abi {
    use std::ffi::c_int;

    pub const F_SETSIG: c_int = 10;
    pub const F_GETSIG: c_int = 11;
    pub const F_SETOWN_EX: c_int = 15;
    pub const F_GETOWN_EX: c_int = 16;

    #[repr(C)]
    pub struct f_owner_ex {
        pub type_: c_int,
        pub pid: c_int,
    }
}

// ── Connect timeout configuration ──

const DEFAULT_CONNECT_TIMEOUT_MS: i64 = 5000;

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_CONNECT_TIMEOUT_MS as u64);
static CONNECT_TIMEOUT_INIT: Once = Once::new();

/// Current `connect` deadline for hooked sockets (ms)
///
/// Backed by the `tcp.connect.timeout` config variable; a listener keeps
/// this cache current so the connect shim never takes the registry lock.
pub fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_INIT.call_once(|| {
        let var = config::lookup_int(
            "tcp.connect.timeout",
            DEFAULT_CONNECT_TIMEOUT_MS,
            "tcp connect timeout in milliseconds",
        );
        CONNECT_TIMEOUT_MS.store(var.get() as u64, Ordering::Relaxed);
        var.add_listener(Box::new(|old, new| {
            winfo!("tcp connect timeout changed from {} to {}", old, new);
            CONNECT_TIMEOUT_MS.store(new as u64, Ordering::Relaxed);
        }));
    });
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

// ── Sleep family ──

/// Park the current fiber for `ms` via a reactor timer
///
/// Returns false when the thread carries no fiber or reactor; the caller
/// falls back to the origin sleep.
fn cooperative_sleep(ms: u64) -> bool {
    let (Some(reactor), Some(sleeper)) = (Reactor::current(), fiber::current()) else {
        return false;
    };
    reactor.add_timer(ms, Box::new(move || sleeper.resume()));
    fiber::yield_current();
    true
}

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if is_hook_enable() && cooperative_sleep(seconds as u64 * 1000) {
        return 0;
    }
    (origin::table().sleep)(seconds)
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: useconds_t) -> c_int {
    if is_hook_enable() && cooperative_sleep(usec as u64 / 1000) {
        return 0;
    }
    (origin::table().usleep)(usec)
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if !is_hook_enable() || req.is_null() {
        return (origin::table().nanosleep)(req, rem);
    }
    let request = &*req;
    if request.tv_sec < 0 || !(0..1_000_000_000).contains(&request.tv_nsec) {
        // Let the kernel produce the EINVAL
        return (origin::table().nanosleep)(req, rem);
    }
    let ms = request.tv_sec as u64 * 1000 + request.tv_nsec as u64 / 1_000_000;
    if cooperative_sleep(ms) {
        // A hooked sleep is never woken early, so rem stays untouched
        return 0;
    }
    (origin::table().nanosleep)(req, rem)
}

// ── Socket lifecycle ──

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (origin::table().socket)(domain, ty, protocol);
    if !is_hook_enable() || fd < 0 {
        return fd;
    }
    fd_table::get_or_create(fd);
    fd
}

/// `connect` with an explicit deadline
///
/// The kernel reports a nonblocking connect as in-progress rather than
/// would-block, so this cannot reuse the generic transform: it waits for
/// writability once, then reads the verdict out of `SO_ERROR`.
#[no_mangle]
pub unsafe extern "C" fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    let table = origin::table();
    if !is_hook_enable() {
        return (table.connect)(fd, addr, addrlen);
    }
    let Some(entry) = fd_table::get(fd) else {
        return (table.connect)(fd, addr, addrlen);
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return (table.connect)(fd, addr, addrlen);
    }

    let n = (table.connect)(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let token = WaitToken::new();
    if !suspend(fd, "connect", IoEvent::Write, timeout_ms, &token) {
        return -1;
    }

    // Writability only signals completion; the verdict is in SO_ERROR
    let mut so_error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = (table.getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut so_error as *mut c_int as *mut c_void,
        &mut len,
    );
    if rc == -1 {
        return -1;
    }
    if so_error == 0 {
        0
    } else {
        set_errno(so_error);
        -1
    }
}

#[no_mangle]
pub unsafe extern "C" fn connect(sockfd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, connect_timeout_ms())
}

#[no_mangle]
pub unsafe extern "C" fn accept(s: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let fd = do_io(s, "accept", IoEvent::Read, SocketTimeout::Recv, || {
        (origin::table().accept)(s, addr, addrlen) as ssize_t
    }) as c_int;
    if fd >= 0 && is_hook_enable() {
        // Track the accepted descriptor; the probe forces sys-nonblock
        fd_table::get_or_create(fd);
    }
    fd
}

// ── Read family ──

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", IoEvent::Read, SocketTimeout::Recv, || {
        (origin::table().read)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", IoEvent::Read, SocketTimeout::Recv, || {
        (origin::table().readv)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(sockfd, "recv", IoEvent::Read, SocketTimeout::Recv, || {
        (origin::table().recv)(sockfd, buf, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(sockfd, "recvfrom", IoEvent::Read, SocketTimeout::Recv, || {
        (origin::table().recvfrom)(sockfd, buf, len, flags, src_addr, addrlen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(sockfd, "recvmsg", IoEvent::Read, SocketTimeout::Recv, || {
        (origin::table().recvmsg)(sockfd, msg, flags)
    })
}

// ── Write family ──

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", IoEvent::Write, SocketTimeout::Send, || {
        (origin::table().write)(fd, buf, count)
    })
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", IoEvent::Write, SocketTimeout::Send, || {
        (origin::table().writev)(fd, iov, iovcnt)
    })
}

#[no_mangle]
pub unsafe extern "C" fn send(s: c_int, msg: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(s, "send", IoEvent::Write, SocketTimeout::Send, || {
        (origin::table().send)(s, msg, len, flags)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    s: c_int,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(s, "sendto", IoEvent::Write, SocketTimeout::Send, || {
        (origin::table().sendto)(s, msg, len, flags, to, tolen)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(s: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(s, "sendmsg", IoEvent::Write, SocketTimeout::Send, || {
        (origin::table().sendmsg)(s, msg, flags)
    })
}

// ── close ──

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let table = origin::table();
    if !is_hook_enable() {
        return (table.close)(fd);
    }
    if fd_table::get(fd).is_some() {
        if let Some(reactor) = Reactor::current() {
            // Every waiter observes ECANCELED synchronously, before the
            // kernel descriptor goes away
            reactor.cancel_all(fd);
        }
        fd_table::remove(fd);
    }
    (table.close)(fd)
}

// ── fcntl / ioctl ──

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    let table = origin::table();
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            let entry = fd_table::get(fd);
            match entry {
                Some(entry) if !entry.is_closed() && entry.is_socket() => {
                    entry.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // The kernel keeps the union of both nonblock owners
                    if entry.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    (table.fcntl)(fd, cmd, flags)
                }
                _ => (table.fcntl)(fd, cmd, flags),
            }
        }
        libc::F_GETFL => {
            let flags = (table.fcntl)(fd, cmd);
            if flags == -1 {
                return -1;
            }
            match fd_table::get(fd) {
                Some(entry) if !entry.is_closed() && entry.is_socket() => {
                    // Report what the user asked for, not the forced flag
                    if entry.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        // int argument
        libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC
        | libc::F_SETFD
        | libc::F_SETOWN
        | libc_abi::F_SETSIG
        | libc::F_SETLEASE
        | libc::F_NOTIFY
        | libc::F_SETPIPE_SZ => (table.fcntl)(fd, cmd, arg as c_int),
        // no argument
        libc::F_GETFD
        | libc::F_GETOWN
        | libc_abi::F_GETSIG
        | libc::F_GETLEASE
        | libc::F_GETPIPE_SZ => (table.fcntl)(fd, cmd),
        // struct flock *
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK => {
            (table.fcntl)(fd, cmd, arg as *mut libc::flock)
        }
        // struct f_owner_ex *
        libc_abi::F_GETOWN_EX | libc_abi::F_SETOWN_EX => {
            (table.fcntl)(fd, cmd, arg as *mut libc_abi::f_owner_ex)
        }
        _ => (table.fcntl)(fd, cmd),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    let table = origin::table();
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        if let Some(entry) = fd_table::get(fd) {
            if !entry.is_closed() && entry.is_socket() {
                let user_nonblock = *(arg as *const c_int) != 0;
                entry.set_user_nonblock(user_nonblock);
                // The kernel flag stays the union: clearing user-nonblock
                // must not undo the forced sys-nonblock
                let mut kernel_flag: c_int =
                    (user_nonblock || entry.sys_nonblock()) as c_int;
                return (table.ioctl)(fd, request, &mut kernel_flag as *mut c_int);
            }
        }
    }
    (table.ioctl)(fd, request, arg)
}

// ── Socket options ──

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (origin::table().getsockopt)(sockfd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    let table = origin::table();
    if !is_hook_enable() {
        return (table.setsockopt)(sockfd, level, optname, optval, optlen);
    }
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<timeval>()
    {
        if let Some(entry) = fd_table::get(sockfd) {
            let tv = &*(optval as *const timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            // A zero timeval disables the timeout
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let which = if optname == libc::SO_RCVTIMEO {
                SocketTimeout::Recv
            } else {
                SocketTimeout::Send
            };
            entry.set_timeout_ms(which, ms);
        }
    }
    (table.setsockopt)(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_tracks_config() {
        assert_eq!(connect_timeout_ms(), DEFAULT_CONNECT_TIMEOUT_MS as u64);

        let var = config::lookup_int("tcp.connect.timeout", DEFAULT_CONNECT_TIMEOUT_MS, "");
        var.set(100);
        assert_eq!(connect_timeout_ms(), 100);

        // Negative means "no deadline"
        var.set(-1);
        assert_eq!(connect_timeout_ms(), NO_TIMEOUT);

        var.set(DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(connect_timeout_ms(), DEFAULT_CONNECT_TIMEOUT_MS as u64);
    }
}
