//! Runtime diagnostics for weft
//!
//! The shims sit underneath arbitrary user I/O, so diagnostics cannot go
//! through a logging facade that might buffer, allocate lazily, or perform
//! hooked I/O of its own at surprising times. What weft actually emits is
//! small: reactor lifecycle lines, registration failures, and config
//! changes. This module is sized to exactly that — three levels, one
//! locked write per line, nothing else.
//!
//! The threshold comes from `WEFT_LOG_LEVEL` (`off`, `error`, `warn`,
//! `info`, or `0`-`3`) and can be moved at runtime with [`set_threshold`].
//! Error lines are flushed unconditionally: they are most valuable right
//! before an abort, which is exactly when buffered output is lost.

use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

/// Verbosity of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
}

impl LogLevel {
    /// Tag rendered into the line prefix
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
        }
    }

    /// Position in the threshold ordering; 0 is reserved for "silent"
    fn rank(self) -> u8 {
        match self {
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
        }
    }
}

const SILENT: u8 = 0;
const DEFAULT_THRESHOLD: u8 = 3; // info

/// Messages print while their rank is <= the threshold
static THRESHOLD: AtomicU8 = AtomicU8::new(DEFAULT_THRESHOLD);
static ENV_READ: Once = Once::new();

fn parse_threshold(raw: &str) -> u8 {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "0" => SILENT,
        "error" | "1" => 1,
        "warn" | "warning" | "2" => 2,
        "info" | "3" => 3,
        _ => DEFAULT_THRESHOLD,
    }
}

/// Read `WEFT_LOG_LEVEL` once
///
/// Happens lazily on the first emit; call explicitly for deterministic
/// startup ordering.
pub fn init() {
    ENV_READ.call_once(|| {
        if let Some(raw) = crate::env::raw("log.level") {
            THRESHOLD.store(parse_threshold(&raw), Ordering::Relaxed);
        }
    });
}

/// Move the threshold at runtime; `None` silences everything
///
/// Overrides whatever the environment said.
pub fn set_threshold(level: Option<LogLevel>) {
    ENV_READ.call_once(|| {});
    THRESHOLD.store(level.map_or(SILENT, LogLevel::rank), Ordering::Relaxed);
}

/// Whether a message at `level` would currently print
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    init();
    level.rank() <= THRESHOLD.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn _emit(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "weft[{}] {}", level.tag(), args);
    if level == LogLevel::Error {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _emit_raw(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "{}", args);
    let _ = out.flush();
}

/// Unconditional line to stderr, flushed
///
/// For messages that must come out even when logging is silenced, like the
/// diagnostic printed just before an init-failure abort.
#[macro_export]
macro_rules! wprintln {
    ($($arg:tt)*) => {
        $crate::wprint::_emit_raw(format_args!($($arg)*))
    };
}

/// Error line, always flushed
#[macro_export]
macro_rules! werror {
    ($($arg:tt)*) => {
        $crate::wprint::_emit($crate::wprint::LogLevel::Error, format_args!($($arg)*))
    };
}

/// Warning line
#[macro_export]
macro_rules! wwarn {
    ($($arg:tt)*) => {
        $crate::wprint::_emit($crate::wprint::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Info line
#[macro_export]
macro_rules! winfo {
    ($($arg:tt)*) => {
        $crate::wprint::_emit($crate::wprint::LogLevel::Info, format_args!($($arg)*))
    };
}
