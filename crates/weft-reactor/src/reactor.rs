//! # Reactor — epoll multiplexer and fiber scheduler
//!
//! One reactor owns a dedicated poll thread. Fibers register interest in a
//! descriptor and yield; the poll thread:
//!
//! 1. Sleeps in `epoll_wait` until readiness, a timer deadline, or a tickle
//!    on the self-pipe
//! 2. Runs due timer callbacks from the [`HeapTimerSet`]
//! 3. Takes the waiters matching each ready descriptor and resumes their
//!    fibers
//!
//! Cancellation (`cancel_event`, `cancel_all`) delivers the pending
//! continuation synchronously on the caller's thread, before the cancel
//! returns. `cancel_all` additionally stamps `ECANCELED` into each waiter's
//! token, which is how a closing descriptor turns into an error return in
//! the fiber that was blocked on it.
//!
//! The poll thread carries no fiber and must never suspend cooperatively.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_int;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Instant;

use weft_core::{werror, winfo};

use crate::fiber::{self, FiberHandle};
use crate::timer::{HeapTimerSet, TimerCallback, TimerEntry, TimerHandle, TimerSet};
use crate::token::WaitToken;

/// Direction of interest on a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    Read,
    Write,
}

/// Errors from event registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorError {
    /// The calling thread carries no fiber to bind as continuation
    NoCurrentFiber,
    /// A waiter for this (fd, direction) is already pending
    AlreadyRegistered,
    /// The kernel rejected the registration
    Os(c_int),
}

impl ReactorError {
    /// Errno a shim should surface for this failure
    pub fn as_errno(&self) -> c_int {
        match self {
            ReactorError::NoCurrentFiber => libc::ENOTSUP,
            ReactorError::AlreadyRegistered => libc::EEXIST,
            ReactorError::Os(err) => *err,
        }
    }
}

impl std::fmt::Display for ReactorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReactorError::NoCurrentFiber => write!(f, "no current fiber on this thread"),
            ReactorError::AlreadyRegistered => write!(f, "event already registered"),
            ReactorError::Os(err) => write!(f, "os error {}", err),
        }
    }
}

impl std::error::Error for ReactorError {}

/// A fiber parked on one (fd, direction)
struct Waiter {
    fiber: FiberHandle,
    token: Weak<WaitToken>,
}

#[derive(Default)]
struct FdInterest {
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdInterest {
    fn epoll_mask(&self) -> u32 {
        let mut mask = 0;
        if self.read.is_some() {
            mask |= libc::EPOLLIN as u32;
        }
        if self.write.is_some() {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// Poll-thread sleep cap when no timer is due sooner (ms)
const MAX_POLL_TIMEOUT_MS: u64 = 3000;

/// The I/O reactor
///
/// Create with [`Reactor::new`]; run fibers against it with
/// [`Reactor::spawn`]; stop it with [`Reactor::shutdown`].
pub struct Reactor {
    name: String,
    epfd: RawFd,
    wake_rd: RawFd,
    wake_wr: RawFd,
    waiters: Mutex<HashMap<RawFd, FdInterest>>,
    timers: HeapTimerSet,
    shutdown: AtomicBool,
    poll_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Arc<Reactor>>> = const { RefCell::new(None) };
}

/// Install `reactor` as this thread's current reactor
pub fn set_current(reactor: &Arc<Reactor>) {
    CURRENT_REACTOR.with(|cell| *cell.borrow_mut() = Some(reactor.clone()));
}

/// Clear this thread's current reactor
pub fn clear_current() {
    CURRENT_REACTOR.with(|cell| *cell.borrow_mut() = None);
}

impl Reactor {
    /// Create a reactor and start its poll thread
    pub fn new(name: &str) -> std::io::Result<Arc<Self>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        let [wake_rd, wake_wr] = pipe_fds;

        // The self-pipe stays registered for the reactor's whole life
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_rd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_rd, &mut ev) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(wake_rd);
                libc::close(wake_wr);
                libc::close(epfd);
            }
            return Err(err);
        }

        let reactor = Arc::new(Self {
            name: name.to_string(),
            epfd,
            wake_rd,
            wake_wr,
            waiters: Mutex::new(HashMap::new()),
            timers: HeapTimerSet::new(),
            shutdown: AtomicBool::new(false),
            poll_thread: Mutex::new(None),
        });

        let poll_clone = reactor.clone();
        let handle = thread::Builder::new()
            .name(format!("weft-reactor/{}", name))
            .spawn(move || poll_clone.poll_loop())?;
        *reactor.poll_thread.lock().unwrap() = Some(handle);

        winfo!("weft-reactor/{}: started", reactor.name);
        Ok(reactor)
    }

    /// Reactor bound to the calling thread, if any
    #[inline]
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|cell| cell.borrow().clone())
    }

    /// Run `f` as a fiber of this reactor
    ///
    /// The fiber gets its own carrier thread with the current-fiber and
    /// current-reactor slots installed before `f` runs.
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> thread::JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let reactor = self.clone();
        let fiber = FiberHandle::new();
        thread::Builder::new()
            .name(format!("weft-fiber-{}", fiber.id()))
            .spawn(move || {
                fiber::set_current(&fiber);
                set_current(&reactor);
                f();
                clear_current();
                fiber::clear_current();
            })
            .expect("failed to spawn fiber carrier thread")
    }

    // ── Event registration ──

    /// Register interest in `fd` for the current fiber
    ///
    /// The fiber is bound as the event's continuation: when the descriptor
    /// becomes ready (or the registration is cancelled) the fiber is
    /// scheduled. `witness` lets `cancel_all` stamp the waiter's token.
    ///
    /// At most one waiter per (fd, direction).
    pub fn add_event(
        &self,
        fd: RawFd,
        event: IoEvent,
        witness: Weak<WaitToken>,
    ) -> Result<(), ReactorError> {
        let fiber = fiber::current().ok_or(ReactorError::NoCurrentFiber)?;

        let mut waiters = self.waiters.lock().unwrap();
        let interest = waiters.entry(fd).or_default();
        let existed = interest.epoll_mask() != 0;

        let slot = match event {
            IoEvent::Read => &mut interest.read,
            IoEvent::Write => &mut interest.write,
        };
        if slot.is_some() {
            return Err(ReactorError::AlreadyRegistered);
        }
        *slot = Some(Waiter {
            fiber,
            token: witness,
        });

        let mask = interest.epoll_mask();
        if let Err(err) = self.epoll_update(fd, mask, existed) {
            // Roll the slot back so a retry can re-register
            let interest = waiters.get_mut(&fd).unwrap();
            match event {
                IoEvent::Read => interest.read = None,
                IoEvent::Write => interest.write = None,
            }
            if interest.is_empty() {
                waiters.remove(&fd);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Cancel a pending event, delivering its continuation synchronously
    ///
    /// Returns false if nothing was pending. The token is not stamped; a
    /// canceller that wants the waiter to see an error stamps it first.
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock().unwrap();
            let Some(interest) = waiters.get_mut(&fd) else {
                return false;
            };
            let taken = match event {
                IoEvent::Read => interest.read.take(),
                IoEvent::Write => interest.write.take(),
            };
            if taken.is_some() {
                let mask = interest.epoll_mask();
                let _ = self.epoll_update(fd, mask, true);
                if interest.is_empty() {
                    waiters.remove(&fd);
                }
            }
            taken
        };

        match waiter {
            Some(waiter) => {
                self.schedule(waiter.fiber);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending event on `fd`, stamping `ECANCELED`
    ///
    /// Each waiter's continuation runs synchronously before this returns,
    /// which is what lets `close` guarantee blocked fibers observe the
    /// close before the kernel descriptor goes away.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let interest = {
            let mut waiters = self.waiters.lock().unwrap();
            let interest = waiters.remove(&fd);
            if interest.is_some() {
                let _ = self.epoll_update(fd, 0, true);
            }
            interest
        };

        let Some(interest) = interest else {
            return false;
        };
        let mut any = false;
        for waiter in [interest.read, interest.write].into_iter().flatten() {
            if let Some(token) = waiter.token.upgrade() {
                token.cancel(libc::ECANCELED);
            }
            self.schedule(waiter.fiber);
            any = true;
        }
        any
    }

    /// Make a fiber runnable
    #[inline]
    pub fn schedule(&self, fiber: FiberHandle) {
        fiber.resume();
    }

    // ── Timers ──

    /// Fire `callback` on the poll thread after `ms` milliseconds
    pub fn add_timer(&self, ms: u64, callback: TimerCallback) -> TimerHandle {
        let handle = self.timers.insert(TimerEntry::after(ms, callback));
        self.tickle();
        handle
    }

    /// Conditional timer: `callback` runs only if `witness` still upgrades
    pub fn add_conditional_timer(
        &self,
        ms: u64,
        callback: TimerCallback,
        witness: Weak<WaitToken>,
    ) -> TimerHandle {
        let handle = self
            .timers
            .insert(TimerEntry::conditional(ms, callback, witness));
        self.tickle();
        handle
    }

    /// Cancel a timer (idempotent; the timer may already have fired)
    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.timers.cancel(handle)
    }

    // ── Lifecycle ──

    /// Stop and join the poll thread
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tickle();
        let handle = self.poll_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        winfo!("weft-reactor/{}: shutdown", self.name);
    }

    // ── Internals ──

    /// Apply the interest mask for `fd` to the epoll set
    fn epoll_update(&self, fd: RawFd, mask: u32, existed: bool) -> Result<(), ReactorError> {
        let op = if mask == 0 {
            libc::EPOLL_CTL_DEL
        } else if existed {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            // DEL on an already-closed fd is expected during close teardown
            let err = weft_core::errno::errno();
            if op == libc::EPOLL_CTL_DEL {
                return Ok(());
            }
            return Err(ReactorError::Os(err));
        }
        Ok(())
    }

    /// Wake the poll thread out of epoll_wait
    fn tickle(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.wake_wr, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_rd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn poll_timeout_ms(&self) -> c_int {
        match self.timers.next_deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Round up so we never spin on a sub-millisecond remainder
                let ms = remaining.as_millis() as u64 + 1;
                ms.min(MAX_POLL_TIMEOUT_MS) as c_int
            }
            None => MAX_POLL_TIMEOUT_MS as c_int,
        }
    }

    fn poll_loop(self: Arc<Self>) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let timeout = self.poll_timeout_ms();
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as c_int, timeout)
            };
            if n < 0 {
                if weft_core::errno::errno() == libc::EINTR {
                    continue;
                }
                werror!("weft-reactor/{}: epoll_wait failed, stopping", self.name);
                break;
            }

            // Due timers first: a timeout and readiness in the same wake
            // resolve in the timer's favor, matching the waiter's token
            // being stamped before its event is cancelled.
            for callback in self.timers.poll_expired(Instant::now()) {
                callback();
            }

            let mut runnable = Vec::new();
            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                if fd == self.wake_rd {
                    self.drain_wake_pipe();
                    continue;
                }

                let flags = ev.events;
                // Errors and hangups wake both directions so waiters can
                // retry and observe the real errno.
                let read_ready = flags
                    & (libc::EPOLLIN as u32 | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32)
                    != 0;
                let write_ready = flags
                    & (libc::EPOLLOUT as u32 | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32)
                    != 0;

                let mut waiters = self.waiters.lock().unwrap();
                if let Some(interest) = waiters.get_mut(&fd) {
                    if read_ready {
                        if let Some(waiter) = interest.read.take() {
                            runnable.push(waiter.fiber);
                        }
                    }
                    if write_ready {
                        if let Some(waiter) = interest.write.take() {
                            runnable.push(waiter.fiber);
                        }
                    }
                    let mask = interest.epoll_mask();
                    let _ = self.epoll_update(fd, mask, true);
                    if interest.is_empty() {
                        waiters.remove(&fd);
                    }
                }
            }

            for fiber in runnable {
                self.schedule(fiber);
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Poll thread holds an Arc, so by the time we drop it has exited
        unsafe {
            libc::close(self.wake_rd);
            libc::close(self.wake_wr);
            libc::close(self.epfd);
        }
    }
}
