//! Deadline set with conditional (weak-witness) entries
//!
//! Pluggable behind the [`TimerSet`] trait; the default implementation is a
//! binary min-heap with lazy cancellation.
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) amortized (lazy: cancelled handles sit in a HashSet and
//!   are skipped at poll time; the set is cleared when the heap drains)
//! - Poll expired: O(k log n) for k due timers
//!
//! Conditional entries carry a `Weak<WaitToken>` witness. At expiry the
//! witness is upgraded first; if the waiter already returned, the upgrade
//! fails and the callback never runs. This is what keeps a timer that
//! outlives its wait from touching freed state.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use crate::token::WaitToken;

/// Boxed expiry action, run by the reactor's poll thread
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Globally unique timer handle for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

impl TimerHandle {
    /// Generate a new unique handle
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One scheduled deadline
pub struct TimerEntry {
    pub handle: TimerHandle,
    pub deadline: Instant,
    pub callback: TimerCallback,
    /// Present on conditional timers; expiry is gated on a live witness
    pub witness: Option<Weak<WaitToken>>,
}

impl TimerEntry {
    /// Plain timer: fire `callback` after `ms` milliseconds
    pub fn after(ms: u64, callback: TimerCallback) -> Self {
        Self {
            handle: TimerHandle::new(),
            deadline: Instant::now() + Duration::from_millis(ms),
            callback,
            witness: None,
        }
    }

    /// Conditional timer: fire only if `witness` still upgrades at expiry
    pub fn conditional(ms: u64, callback: TimerCallback, witness: Weak<WaitToken>) -> Self {
        Self {
            handle: TimerHandle::new(),
            deadline: Instant::now() + Duration::from_millis(ms),
            callback,
            witness: Some(witness),
        }
    }
}

/// Ordered deadline set
///
/// Implementations must be thread-safe: fibers insert and cancel while the
/// poll thread drains.
pub trait TimerSet: Send + Sync {
    /// Insert an entry, returning its handle for cancellation
    fn insert(&self, entry: TimerEntry) -> TimerHandle;

    /// Cancel by handle (best-effort, the timer may already have fired).
    /// Returns true if the timer was found live and cancelled.
    fn cancel(&self, handle: TimerHandle) -> bool;

    /// Remove every due entry, returning the callbacks that should run.
    /// Cancelled entries and conditional entries whose witness is gone are
    /// dropped silently.
    fn poll_expired(&self, now: Instant) -> Vec<TimerCallback>;

    /// Earliest live deadline, if any
    fn next_deadline(&self) -> Option<Instant>;

    /// Number of scheduled (non-cancelled) timers
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Heap ordering wrapper (min-heap by deadline, handle tie-break)
struct HeapSlot {
    handle: TimerHandle,
    deadline: Instant,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.handle.0.cmp(&self.handle.0),
            ord => ord,
        }
    }
}

struct HeapInner {
    heap: BinaryHeap<HeapSlot>,
    /// Payloads keyed by handle; removed when the slot pops or cancels
    entries: std::collections::HashMap<u64, TimerEntry>,
    cancelled: HashSet<TimerHandle>,
}

/// BinaryHeap-based [`TimerSet`]
pub struct HeapTimerSet {
    inner: Mutex<HeapInner>,
}

impl HeapTimerSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                heap: BinaryHeap::with_capacity(64),
                entries: std::collections::HashMap::with_capacity(64),
                cancelled: HashSet::new(),
            }),
        }
    }
}

impl Default for HeapTimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerSet for HeapTimerSet {
    fn insert(&self, entry: TimerEntry) -> TimerHandle {
        let handle = entry.handle;
        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(HeapSlot {
            handle,
            deadline: entry.deadline,
        });
        inner.entries.insert(handle.0, entry);
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(&handle.0).is_some() {
            inner.cancelled.insert(handle);
            true
        } else {
            false
        }
    }

    fn poll_expired(&self, now: Instant) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();

        while let Some(slot) = inner.heap.peek() {
            if slot.deadline > now {
                break;
            }
            let slot = inner.heap.pop().unwrap();

            if inner.cancelled.remove(&slot.handle) {
                continue;
            }
            let Some(entry) = inner.entries.remove(&slot.handle.0) else {
                continue;
            };

            // Conditional: fire only while the waiter is still around
            if let Some(witness) = &entry.witness {
                if witness.upgrade().is_none() {
                    continue;
                }
            }
            due.push(entry.callback);
        }

        if inner.heap.is_empty() {
            inner.cancelled.clear();
        }

        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        // Approximate: a cancelled slot at the front causes one early wake
        inner.heap.peek().map(|slot| slot.deadline)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_cb(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_insert_and_poll() {
        let set = HeapTimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        set.insert(TimerEntry::after(0, counting_cb(&fired)));
        assert_eq!(set.len(), 1);

        let cbs = set.poll_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_not_due_not_returned() {
        let set = HeapTimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        set.insert(TimerEntry::after(10_000, counting_cb(&fired)));
        let cbs = set.poll_expired(Instant::now());
        assert!(cbs.is_empty());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_deadline_ordering() {
        let set = HeapTimerSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (ms, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let order = order.clone();
            set.insert(TimerEntry {
                handle: TimerHandle::new(),
                deadline: now + Duration::from_millis(ms),
                callback: Box::new(move || order.lock().unwrap().push(tag)),
                witness: None,
            });
        }

        for cb in set.poll_expired(now + Duration::from_millis(50)) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_cancel() {
        let set = HeapTimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = set.insert(TimerEntry::after(0, counting_cb(&fired)));
        assert!(set.cancel(handle));
        assert!(!set.cancel(handle)); // idempotent

        let cbs = set.poll_expired(Instant::now() + Duration::from_millis(1));
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_conditional_skipped_when_witness_dead() {
        let set = HeapTimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let token = WaitToken::new();
        set.insert(TimerEntry::conditional(
            0,
            counting_cb(&fired),
            Arc::downgrade(&token),
        ));
        drop(token); // waiter returned before expiry

        let cbs = set.poll_expired(Instant::now() + Duration::from_millis(1));
        assert!(cbs.is_empty());
    }

    #[test]
    fn test_conditional_fires_while_witness_live() {
        let set = HeapTimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let token = WaitToken::new();
        set.insert(TimerEntry::conditional(
            0,
            counting_cb(&fired),
            Arc::downgrade(&token),
        ));

        for cb in set.poll_expired(Instant::now() + Duration::from_millis(1)) {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_deadline() {
        let set = HeapTimerSet::new();
        assert!(set.next_deadline().is_none());

        let now = Instant::now();
        set.insert(TimerEntry::after(100, Box::new(|| {})));
        let deadline = set.next_deadline().unwrap();
        assert!(deadline > now);
        assert!(deadline <= now + Duration::from_millis(150));
    }
}
