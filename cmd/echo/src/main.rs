//! Weft Echo Server
//!
//! Fiber-per-connection TCP echo server written against plain blocking
//! libc calls. Nothing in the connection handler knows about the reactor:
//! the hook layer turns every would-block into a fiber suspension.
//!
//! Usage:
//!     cargo run --release -p weft-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9900

use std::ffi::{c_int, c_void};

use weft_core::{winfo, wwarn};
use weft_hook::{set_hook_enable, shims};
use weft_reactor::reactor::Reactor;

const DEFAULT_PORT: u16 = 9900;
const BUF_SIZE: usize = 4096;

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

/// Create, bind and listen; returns the listener fd
///
/// Goes through the socket shim so the descriptor is tracked and the
/// subsequent accept suspends instead of blocking the carrier.
fn bind_listener(port: u16) -> Result<c_int, c_int> {
    let fd = unsafe { shims::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(errno());
    }

    unsafe {
        let opt: c_int = 1;
        shims::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const c_int as *const c_void,
            4,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as u16;
    addr.sin_addr.s_addr = 0; // INADDR_ANY
    addr.sin_port = port.to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = errno();
        unsafe { shims::close(fd) };
        return Err(err);
    }

    if unsafe { libc::listen(fd, 1024) } != 0 {
        let err = errno();
        unsafe { shims::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

/// Echo until EOF; written as if recv/send were blocking
fn handle_connection(fd: c_int) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = unsafe { shims::recv(fd, buf.as_mut_ptr() as *mut c_void, BUF_SIZE, 0) };
        if n <= 0 {
            if n < 0 {
                wwarn!("recv on fd {} failed: errno {}", fd, errno());
            }
            break;
        }

        let mut sent: libc::ssize_t = 0;
        while sent < n {
            let m = unsafe {
                shims::send(
                    fd,
                    buf[sent as usize..].as_ptr() as *const c_void,
                    (n - sent) as usize,
                    0,
                )
            };
            if m <= 0 {
                wwarn!("send on fd {} failed: errno {}", fd, errno());
                unsafe { shims::close(fd) };
                return;
            }
            sent += m;
        }
    }
    unsafe { shims::close(fd) };
}

fn main() {
    weft_hook::init();

    let port = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let reactor = Reactor::new("echo").expect("failed to start reactor");

    let acceptor = reactor.clone();
    let accept_loop = reactor.spawn(move || {
        set_hook_enable(true);

        let listener = match bind_listener(port) {
            Ok(fd) => fd,
            Err(err) => {
                wwarn!("bind on port {} failed: errno {}", port, err);
                return;
            }
        };
        winfo!("weft-echo: listening on port {}", port);

        loop {
            let conn = unsafe { shims::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if conn < 0 {
                wwarn!("accept failed: errno {}", errno());
                continue;
            }
            acceptor.spawn(move || {
                set_hook_enable(true);
                handle_connection(conn);
            });
        }
    });

    let _ = accept_loop.join();
}
