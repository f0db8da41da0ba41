//! Thread-local `errno` access
//!
//! The interception shims must preserve standard POSIX error reporting:
//! return -1 and leave the cause in `errno`. These helpers read and write
//! the calling thread's errno slot directly so a shim can absorb internal
//! errors (EINTR, EAGAIN) and surface its own (ETIMEDOUT, EBADF) without
//! disturbing anything else the callee stored there.

use std::ffi::c_int;

/// Read the calling thread's errno
#[inline]
pub fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

/// Set the calling thread's errno
#[inline]
pub fn set_errno(err: c_int) {
    unsafe {
        *libc::__errno_location() = err;
    }
}

/// Errno of the last failed libc call, with a fallback when libc reported
/// success but the caller knows better
#[inline]
pub fn last_os_errno(default: c_int) -> c_int {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_read() {
        set_errno(libc::ETIMEDOUT);
        assert_eq!(errno(), libc::ETIMEDOUT);
        set_errno(0);
        assert_eq!(errno(), 0);
    }

    #[test]
    fn test_last_os_errno_reflects_failure() {
        // read() on a known-bad descriptor leaves EBADF behind
        let rc = unsafe { libc::read(-1, std::ptr::null_mut(), 0) };
        assert_eq!(rc, -1);
        assert_eq!(last_os_errno(0), libc::EBADF);
    }
}
