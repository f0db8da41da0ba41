//! Fibers and the thread-local current-fiber slot
//!
//! A fiber is a unit of cooperative execution that suspends at explicit
//! yield points and is resumed by the reactor (or a canceller). Each fiber
//! runs on its own carrier thread; suspension parks the carrier behind a
//! mutex/condvar pair with a pending-wake flag, so a resume that lands
//! before the yield is consumed instead of lost.
//!
//! Only the fiber itself may yield; anyone holding a [`FiberHandle`] may
//! resume it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

struct FiberInner {
    /// Protected flag: a wake is pending and the next yield must not sleep
    mutex: Mutex<bool>,
    condvar: Condvar,
    id: u64,
}

/// Cloneable handle to a fiber
///
/// Held by the reactor's waiter table and timer callbacks; `resume()` from
/// any thread makes the fiber runnable again.
#[derive(Clone)]
pub struct FiberHandle {
    inner: Arc<FiberInner>,
}

impl FiberHandle {
    /// Create a fresh fiber handle with a unique id
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(FiberInner {
                mutex: Mutex::new(false),
                condvar: Condvar::new(),
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// Unique fiber id (for logging)
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Make the fiber runnable again
    ///
    /// Safe to call before the fiber yields: the wake is remembered and the
    /// next yield returns immediately.
    pub fn resume(&self) {
        let mut pending = self.inner.mutex.lock().unwrap();
        *pending = true;
        self.inner.condvar.notify_one();
    }

    /// Park until a wake arrives, consuming it
    ///
    /// If a wake is already pending, returns without sleeping.
    fn wait(&self) {
        let mut pending = self.inner.mutex.lock().unwrap();
        while !*pending {
            pending = self.inner.condvar.wait(pending).unwrap();
        }
        *pending = false;
    }
}

impl Default for FiberHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle").field("id", &self.inner.id).finish()
    }
}

thread_local! {
    static CURRENT_FIBER: RefCell<Option<FiberHandle>> = const { RefCell::new(None) };
}

/// Install `fiber` as this thread's current fiber
///
/// Called by `Reactor::spawn` on the carrier thread before user code runs.
pub fn set_current(fiber: &FiberHandle) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber.clone()));
}

/// Clear this thread's current fiber (carrier going away)
pub fn clear_current() {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = None);
}

/// Handle of the fiber running on this thread, if any
#[inline]
pub fn current() -> Option<FiberHandle> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

/// Suspend the current fiber until someone calls `resume()` on its handle
///
/// Returns immediately if a resume already landed. No-op yield on a thread
/// that carries no fiber would be a bug, so this panics there.
pub fn yield_current() {
    let fiber = current().expect("yield_current called outside a fiber");
    fiber.wait();
}
