//! Process-wide descriptor table
//!
//! Maps a descriptor number to the metadata the shims consult on every
//! call: socket-ness, closed-ness, who set `O_NONBLOCK`, and the stored
//! socket timeouts. One table per process; entries are keyed purely by the
//! fd number the kernel returned, so a close racing an accept that returns
//! the same number simply produces a fresh, independent entry.
//!
//! Lookups vastly outnumber mutations (every read/write consults the
//! table, only socket/accept/close mutate it), so the slot vector sits
//! behind a read-preferring `parking_lot::RwLock` and the per-entry fields
//! are atomics that readers can update without the write lock.

use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::origin;

/// Sentinel: no timeout configured
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which stored timeout an operation consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketTimeout {
    Recv,
    Send,
}

/// Metadata for one open descriptor
pub struct FdEntry {
    fd: c_int,
    /// Determined once at creation via fstat; never changes
    is_socket: bool,
    closed: AtomicBool,
    /// The shim forced O_NONBLOCK at kernel level
    sys_nonblock: AtomicBool,
    /// The user explicitly asked for O_NONBLOCK (F_SETFL / FIONBIO)
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntry {
    /// Probe the descriptor and build its entry
    ///
    /// Sockets get `O_NONBLOCK` forced at the kernel level immediately: the
    /// suspension protocol depends on the kernel never blocking us, and the
    /// user-visible flag is reconstructed from `user_nonblock` instead.
    fn probe(fd: c_int) -> Self {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        let is_socket = rc == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let table = origin::table();
            let flags = unsafe { (table.fcntl)(fd, libc::F_GETFL) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { (table.fcntl)(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        Self {
            fd,
            is_socket,
            closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Relaxed);
    }

    /// Stored timeout for the given direction; `NO_TIMEOUT` if unset
    ///
    /// Non-sockets are never augmented and always report `NO_TIMEOUT`.
    #[inline]
    pub fn timeout_ms(&self, which: SocketTimeout) -> u64 {
        match which {
            SocketTimeout::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            SocketTimeout::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn set_timeout_ms(&self, which: SocketTimeout, ms: u64) {
        if !self.is_socket {
            return;
        }
        match which {
            SocketTimeout::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            SocketTimeout::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdEntry>>>>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::with_capacity(64)),
        }
    }

    fn get(&self, fd: c_int) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read();
        slots.get(fd as usize).and_then(|slot| slot.clone())
    }

    fn get_or_create(&self, fd: c_int) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        if let Some(entry) = self.get(fd) {
            return Some(entry);
        }

        let mut slots = self.slots.write();
        let idx = fd as usize;
        if slots.len() <= idx {
            slots.resize(idx + 1, None);
        }
        // Re-check under the write lock: another thread may have won
        if let Some(entry) = &slots[idx] {
            return Some(entry.clone());
        }
        let entry = Arc::new(FdEntry::probe(fd));
        slots[idx] = Some(entry.clone());
        Some(entry)
    }

    fn remove(&self, fd: c_int) -> Option<Arc<FdEntry>> {
        if fd < 0 {
            return None;
        }
        let mut slots = self.slots.write();
        let entry = slots.get_mut(fd as usize).and_then(|slot| slot.take());
        if let Some(entry) = &entry {
            // In-flight shims holding the Arc observe the close
            entry.mark_closed();
        }
        entry
    }
}

static TABLE: OnceLock<FdTable> = OnceLock::new();

fn instance() -> &'static FdTable {
    TABLE.get_or_init(FdTable::new)
}

/// Look up an existing entry
#[inline]
pub fn get(fd: c_int) -> Option<Arc<FdEntry>> {
    instance().get(fd)
}

/// Look up or register `fd`, probing its type on first sight
#[inline]
pub fn get_or_create(fd: c_int) -> Option<Arc<FdEntry>> {
    instance().get_or_create(fd)
}

/// Drop the entry for `fd`, marking it closed for in-flight holders
#[inline]
pub fn remove(fd: c_int) -> Option<Arc<FdEntry>> {
    instance().remove(fd)
}
