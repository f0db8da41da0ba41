//! Per-wait cancellation tokens
//!
//! Every suspended I/O operation owns one [`WaitToken`]. Timers and the
//! reactor's waiter table hold only `Weak` references (the witness), so a
//! wait that completes normally leaves nothing for a late timer to act on:
//! the upgrade fails and the callback is a no-op.
//!
//! The cancel code is written at most once. Timer expiry and a racing
//! `close` both try to stamp the token; the first compare-exchange wins and
//! the loser backs off, which is what makes repeated cancellation attempts
//! coalesce.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Cancellation state for one in-flight wait
///
/// `0` means the wait is still live; any other value is the errno the
/// waiter must surface (`ETIMEDOUT`, `ECANCELED`).
pub struct WaitToken {
    code: AtomicI32,
}

impl WaitToken {
    /// Fresh live token, strongly owned by the waiting shim
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            code: AtomicI32::new(0),
        })
    }

    /// Stamp a cancel code; returns false if another party already did
    #[inline]
    pub fn cancel(&self, code: i32) -> bool {
        self.code
            .compare_exchange(0, code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The final code, or 0 while the wait is live
    #[inline]
    pub fn code(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.code() != 0
    }
}
