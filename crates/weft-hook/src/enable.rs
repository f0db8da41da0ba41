//! Per-thread interception switch
//!
//! Default **off**: a thread sees raw libc behavior until it opts in.
//! The reactor's poll thread and any other runtime-internal thread must
//! never enable it, or their own descriptor traffic would try to suspend
//! a fiber they don't carry.

use std::cell::Cell;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Opt this thread in or out of cooperative I/O
#[inline]
pub fn set_hook_enable(enabled: bool) {
    HOOK_ENABLED.with(|cell| cell.set(enabled));
}

/// Whether shims on this thread transform blocking calls
#[inline]
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}
