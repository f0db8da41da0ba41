//! Origin symbol slots
//!
//! Each intercepted symbol has a slot holding the real implementation,
//! resolved once via `dlsym(RTLD_NEXT, name)` — the next definition after
//! ours in load order. Shims call through these slots; user code calls the
//! overriding public symbols in [`crate::shims`].
//!
//! Resolution happens once, before first use, behind a `OnceLock`. A symbol
//! that fails to resolve leaves the process in an undefined state, so we
//! abort immediately rather than limp along with a null slot.
//!
//! `fcntl` and `ioctl` keep their C-variadic types so per-command argument
//! forwarding stays ABI-exact; every other slot is fully typed.

use std::ffi::{c_int, c_uint, c_ulong, c_void, CStr};
use std::sync::OnceLock;

use libc::{iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};

pub type SleepFn = unsafe extern "C" fn(c_uint) -> c_uint;
pub type UsleepFn = unsafe extern "C" fn(useconds_t) -> c_int;
pub type NanosleepFn = unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int;
pub type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
pub type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type ReadvFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
pub type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
pub type RecvfromFn = unsafe extern "C" fn(
    c_int,
    *mut c_void,
    size_t,
    c_int,
    *mut sockaddr,
    *mut socklen_t,
) -> ssize_t;
pub type RecvmsgFn = unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type WritevFn = unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t;
pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub type SendtoFn = unsafe extern "C" fn(
    c_int,
    *const c_void,
    size_t,
    c_int,
    *const sockaddr,
    socklen_t,
) -> ssize_t;
pub type SendmsgFn = unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;
pub type IoctlFn = unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int;
pub type GetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int;
pub type SetsockoptFn =
    unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int;

/// Resolve one symbol or abort
fn must_resolve(name: &CStr) -> *mut c_void {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        // A half-initialized interceptor would corrupt arbitrary user I/O
        weft_core::wprintln!(
            "weft-hook: dlsym(RTLD_NEXT, {:?}) failed, aborting",
            name
        );
        std::process::abort();
    }
    sym
}

macro_rules! origin_table {
    ($( $field:ident : $ty:ty => $sym:literal ),+ $(,)?) => {
        /// The resolved real implementations, one slot per symbol
        pub struct OriginTable {
            $( pub $field: $ty, )+
        }

        impl OriginTable {
            fn resolve_all() -> Self {
                Self {
                    $( $field: unsafe {
                        std::mem::transmute::<*mut c_void, $ty>(must_resolve($sym))
                    }, )+
                }
            }
        }
    };
}

origin_table! {
    sleep:      SleepFn      => c"sleep",
    usleep:     UsleepFn     => c"usleep",
    nanosleep:  NanosleepFn  => c"nanosleep",
    socket:     SocketFn     => c"socket",
    connect:    ConnectFn    => c"connect",
    accept:     AcceptFn     => c"accept",
    read:       ReadFn       => c"read",
    readv:      ReadvFn      => c"readv",
    recv:       RecvFn       => c"recv",
    recvfrom:   RecvfromFn   => c"recvfrom",
    recvmsg:    RecvmsgFn    => c"recvmsg",
    write:      WriteFn      => c"write",
    writev:     WritevFn     => c"writev",
    send:       SendFn       => c"send",
    sendto:     SendtoFn     => c"sendto",
    sendmsg:    SendmsgFn    => c"sendmsg",
    close:      CloseFn      => c"close",
    fcntl:      FcntlFn      => c"fcntl",
    ioctl:      IoctlFn      => c"ioctl",
    getsockopt: GetsockoptFn => c"getsockopt",
    setsockopt: SetsockoptFn => c"setsockopt",
}

static ORIGIN: OnceLock<OriginTable> = OnceLock::new();

/// The origin slots, resolving them on first access
///
/// Read-only after initialization; every shim funnels through here.
#[inline]
pub fn table() -> &'static OriginTable {
    ORIGIN.get_or_init(OriginTable::resolve_all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_slots_resolve() {
        // get_or_init aborts the process if any symbol is missing, so
        // reaching the asserts is the test.
        let table = table();
        assert!(!(table.read as *const c_void).is_null());
        assert!(!(table.fcntl as *const c_void).is_null());
    }

    #[test]
    fn test_origin_read_is_real() {
        // The resolved read must behave like the libc one
        let rc = unsafe { (table().read)(-1, std::ptr::null_mut(), 0) };
        assert_eq!(rc, -1);
        assert_eq!(weft_core::errno::errno(), libc::EBADF);
    }
}
