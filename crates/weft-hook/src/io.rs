//! The blocking-to-cooperative transform
//!
//! One body shared by every symmetric read/write-like shim, parameterised
//! by the event direction, the timeout the descriptor stores for that
//! direction, and a closure invoking the origin function.
//!
//! The sequencing here is the heart of the layer and is deliberately
//! explicit — arm timer, register event, yield, cancel timer, inspect the
//! token — so the ordering between timer expiry, event delivery and a
//! racing close stays auditable. Every wait owns a fresh [`WaitToken`];
//! the timer and the reactor's waiter table see it only weakly, so a wait
//! that returns first turns any late timer fire into a no-op.

use std::ffi::c_int;
use std::sync::Arc;

use libc::ssize_t;
use weft_core::errno::{errno, set_errno};
use weft_core::werror;
use weft_reactor::{fiber, reactor::Reactor, IoEvent, WaitToken};

use crate::enable::is_hook_enable;
use crate::fd_table::{self, SocketTimeout, NO_TIMEOUT};

/// Run one intercepted I/O call with blocking semantics for the caller
///
/// `invoke` performs the origin call with the original arguments. The
/// caller sees:
///
/// - the raw result, when the hook is off, the fd is untracked, the fd is
///   not a socket, or the user asked for nonblocking semantics;
/// - `EBADF`, when the entry is (or becomes) closed;
/// - `ETIMEDOUT` / `ECANCELED`, when a deadline or a close ended the wait;
/// - otherwise the result of the first invocation that neither
///   would-blocked nor was interrupted. `EINTR` retries immediately;
///   `EAGAIN` suspends and retries.
pub(crate) fn do_io<F>(
    fd: c_int,
    name: &str,
    event: IoEvent,
    timeout_kind: SocketTimeout,
    mut invoke: F,
) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_hook_enable() {
        return invoke();
    }

    let Some(entry) = fd_table::get(fd) else {
        return invoke();
    };
    if entry.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entry.is_socket() || entry.user_nonblock() {
        return invoke();
    }

    let timeout_ms = entry.timeout_ms(timeout_kind);
    let token = WaitToken::new();

    loop {
        // A close that raced in while we were suspended must win
        if entry.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }

        let mut n = invoke();
        while n == -1 && errno() == libc::EINTR {
            n = invoke();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        if !suspend(fd, name, event, timeout_ms, &token) {
            return -1;
        }
        // Readiness means the kernel *may* accept the call now; spurious
        // wakeups and partial readiness make the retry mandatory.
    }
}

/// Park the current fiber until `fd` is ready, a deadline fires, or the
/// descriptor is closed under us
///
/// Returns true when the caller should retry the syscall; false when the
/// wait ended in an error already placed in `errno`.
pub(crate) fn suspend(
    fd: c_int,
    name: &str,
    event: IoEvent,
    timeout_ms: u64,
    token: &Arc<WaitToken>,
) -> bool {
    let Some(reactor) = Reactor::current() else {
        // Hook enabled on a thread without a reactor: nothing to suspend
        // on. The caller must never see the EAGAIN left by the probe, so
        // report it as a registration failure.
        werror!("{}: would block on fd {} outside a reactor fiber", name, fd);
        set_errno(libc::ENOTSUP);
        return false;
    };

    let timer = if timeout_ms != NO_TIMEOUT {
        let witness = Arc::downgrade(token);
        let reactor_w = Arc::downgrade(&reactor);
        Some(reactor.add_conditional_timer(
            timeout_ms,
            Box::new(move || {
                // No-op unless the wait is still live and unclaimed
                let Some(token) = witness.upgrade() else {
                    return;
                };
                if !token.cancel(libc::ETIMEDOUT) {
                    return;
                }
                if let Some(reactor) = reactor_w.upgrade() {
                    // Delivers the pending continuation synchronously,
                    // resuming the waiter
                    reactor.cancel_event(fd, event);
                }
            }),
            Arc::downgrade(token),
        ))
    } else {
        None
    };

    match reactor.add_event(fd, event, Arc::downgrade(token)) {
        Err(err) => {
            if let Some(handle) = timer {
                reactor.cancel_timer(handle);
            }
            werror!("{}: add_event({}, {:?}) failed: {}", name, fd, event, err);
            set_errno(err.as_errno());
            false
        }
        Ok(()) => {
            fiber::yield_current();
            // Idempotent if the timer already fired; the token state is
            // final either way
            if let Some(handle) = timer {
                reactor.cancel_timer(handle);
            }
            let code = token.code();
            if code != 0 {
                set_errno(code);
                return false;
            }
            true
        }
    }
}
