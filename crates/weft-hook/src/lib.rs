//! # weft-hook — transparent POSIX I/O interception
//!
//! Overrides the blocking libc entry points (sleeps, socket lifecycle, the
//! read/write families, close, fcntl, ioctl, sockopts) so that code written
//! against ordinary blocking calls becomes cooperative when it runs on a
//! weft fiber: instead of blocking the carrier thread, a call that would
//! block parks the fiber on the reactor and retries once the descriptor is
//! ready or a deadline fires.
//!
//! Callers keep bit-exact POSIX semantics: return values, `errno`, and the
//! visibility of the `O_NONBLOCK` flag all behave as if the kernel had
//! blocked. The machinery is invisible unless the current thread opted in
//! via [`set_hook_enable`].
//!
//! ```ignore
//! let reactor = Reactor::new("io")?;
//! reactor.spawn(|| {
//!     weft_hook::set_hook_enable(true);
//!     // Plain blocking code, now cooperative:
//!     let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
//! });
//! ```
//!
//! Module map:
//!
//! - [`origin`] — slots holding the real libc implementations
//! - [`fd_table`] — process-wide descriptor metadata
//! - [`enable`] — the per-thread opt-in switch
//! - [`config`] — named config variables (`tcp.connect.timeout`)
//! - [`io`] — the shared blocking-to-cooperative transform
//! - [`shims`] — the exported symbols themselves

pub mod config;
pub mod enable;
pub mod fd_table;
pub mod io;
pub mod origin;
pub mod shims;

pub use enable::{is_hook_enable, set_hook_enable};

/// Resolve origin symbols and seed the connect-timeout config
///
/// Every shim performs this lazily on first use; call it explicitly at
/// process start for deterministic failure if a symbol cannot be resolved.
pub fn init() {
    weft_core::init_logging();
    origin::table();
    shims::connect_timeout_ms();
}
