//! # weft-reactor — fibers, timers and the I/O reactor
//!
//! The cooperative substrate the interception layer suspends on:
//!
//! - [`fiber`] — parker-backed fibers with thread-local "current fiber"
//! - [`token`] — per-wait cancellation tokens with first-writer-wins codes
//! - [`timer`] — ordered deadline set with weak-witness conditional entries
//! - [`reactor`] — epoll multiplexer that binds fd readiness to fiber
//!   resumption and drives the timer set from its poll thread
//!
//! A blocked operation arms a timer, registers interest, and yields its
//! fiber; the poll thread (or a canceller) later resumes it. The reactor
//! guarantees that cancelling an event delivers the pending continuation
//! synchronously before the cancel returns — the ordering `close` relies on.

pub mod fiber;
pub mod reactor;
pub mod timer;
pub mod token;

pub use fiber::FiberHandle;
pub use reactor::{IoEvent, Reactor, ReactorError};
pub use timer::{HeapTimerSet, TimerCallback, TimerEntry, TimerHandle, TimerSet};
pub use token::WaitToken;
