//! Per-thread state consumed by the primitives.
//!
//! A [`ThreadState`] is created lazily the first time a thread touches a
//! primitive and torn down with the thread's locals. It carries the owner id
//! written into lock words, the cancellation word, scheduling priority with
//! per-mutex boosts, the robust-mutex list and the rwlocks the thread
//! currently reads.

use std::cell::{Cell, OnceCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::cancel;
use super::process;
use super::waitq::{WAKE_ALL, WaitOutcome, WaitQueue};
use crate::time::Deadline;
use crate::trace::{self, SyncFamily};

/// Owner ids fit in the low 30 bits of a lock word.
pub const FUTEX_TID_MASK: u32 = 0x3fff_ffff;

// Cancellation word bits.
pub const CANCELSTATE_BIT: u32 = 0;
pub const CANCELSTATE_BITMASK: u32 = 1 << CANCELSTATE_BIT;
pub const CANCELTYPE_BIT: u32 = 1;
pub const CANCELTYPE_BITMASK: u32 = 1 << CANCELTYPE_BIT;
pub const CANCELING_BIT: u32 = 2;
pub const CANCELING_BITMASK: u32 = 1 << CANCELING_BIT;
pub const CANCELED_BIT: u32 = 3;
pub const CANCELED_BITMASK: u32 = 1 << CANCELED_BIT;
pub const EXITING_BIT: u32 = 4;
pub const EXITING_BITMASK: u32 = 1 << EXITING_BIT;
pub const TERMINATED_BIT: u32 = 5;
pub const TERMINATED_BITMASK: u32 = 1 << TERMINATED_BIT;

/// True when a cancellation word says "unwind now": canceled, enabled,
/// and not already on the way out.
#[must_use]
pub const fn cancel_enabled_and_canceled(value: u32) -> bool {
    value & (CANCELSTATE_BITMASK | CANCELED_BITMASK | EXITING_BITMASK | TERMINATED_BITMASK)
        == CANCELED_BITMASK
}

/// Interval between repeated wakes while a canceled thread stays blocked.
const CANCEL_REWAKE_INTERVAL: Duration = Duration::from_micros(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Boost {
    key: usize,
    source: u32,
    priority: i32,
}

#[derive(Clone, Copy)]
struct RobustEntry {
    addr: usize,
    on_death: unsafe fn(usize, u32),
}

#[derive(Clone, Copy)]
struct BlockedOn {
    addr: usize,
    shared: bool,
    wake: unsafe fn(usize, bool),
}

pub struct ThreadState {
    tid: u32,
    cancelhandling: AtomicU32,
    base_priority: AtomicI32,
    boosts: Mutex<Vec<Boost>>,
    robust: Mutex<Vec<RobustEntry>>,
    read_holds: Mutex<Vec<(usize, u32)>>,
    blocked_on: Mutex<Option<BlockedOn>>,
    parked: AtomicU32,
}

impl core::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadState")
            .field("tid", &self.tid)
            .field("cancelhandling", &self.cancelhandling.load(Ordering::Relaxed))
            .field("effective_priority", &self.effective_priority())
            .finish_non_exhaustive()
    }
}

impl ThreadState {
    fn with_tid(tid: u32) -> Self {
        Self {
            tid,
            cancelhandling: AtomicU32::new(0),
            base_priority: AtomicI32::new(0),
            boosts: Mutex::new(Vec::new()),
            robust: Mutex::new(Vec::new()),
            read_holds: Mutex::new(Vec::new()),
            blocked_on: Mutex::new(None),
            parked: AtomicU32::new(0),
        }
    }

    /// State not bound to any OS thread or registry.
    pub(crate) fn detached(tid: u32) -> Arc<Self> {
        Arc::new(Self::with_tid(tid & FUTEX_TID_MASK))
    }

    #[must_use]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn cancelhandling(&self) -> u32 {
        self.cancelhandling.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_word(&self) -> &AtomicU32 {
        &self.cancelhandling
    }

    /// Request cancellation of this thread.
    ///
    /// The target unwinds at its next cancellation point. If it is blocked in
    /// one right now, its wait word is woken until the target leaves the wait.
    pub fn cancel(&self) {
        let old = self
            .cancelhandling
            .fetch_or(CANCELING_BITMASK | CANCELED_BITMASK, Ordering::SeqCst);
        if old & CANCELED_BITMASK != 0 {
            return;
        }
        trace::record(SyncFamily::Cancel, "cancel", self.tid as usize, "requested");
        loop {
            let v = self.cancelhandling.load(Ordering::SeqCst);
            if v & (CANCELSTATE_BITMASK | EXITING_BITMASK | TERMINATED_BITMASK) != 0 {
                return;
            }
            {
                let blocked = self.blocked_on.lock();
                match *blocked {
                    None => return,
                    // SAFETY: the registration is cleared under this lock before
                    // the waiter's borrow of the word ends.
                    Some(b) => unsafe { (b.wake)(b.addr, b.shared) },
                }
            }
            std::thread::sleep(CANCEL_REWAKE_INTERVAL);
        }
    }

    pub fn base_priority(&self) -> i32 {
        self.base_priority.load(Ordering::Relaxed)
    }

    pub fn set_base_priority(&self, priority: i32) {
        self.base_priority.store(priority, Ordering::Relaxed);
    }

    /// `max(base, every active boost)`.
    pub fn effective_priority(&self) -> i32 {
        let base = self.base_priority();
        self.boosts
            .lock()
            .iter()
            .map(|b| b.priority)
            .fold(base, i32::max)
    }

    pub(crate) fn add_boost(&self, key: usize, source: u32, priority: i32) {
        let mut boosts = self.boosts.lock();
        match boosts.iter_mut().find(|b| b.key == key && b.source == source) {
            Some(b) => b.priority = priority,
            None => boosts.push(Boost {
                key,
                source,
                priority,
            }),
        }
    }

    pub(crate) fn remove_boost(&self, key: usize, source: u32) {
        self.boosts
            .lock()
            .retain(|b| !(b.key == key && b.source == source));
    }

    /// Drop every boost tied to the mutex at `key`.
    pub(crate) fn remove_boosts_for(&self, key: usize) {
        self.boosts.lock().retain(|b| b.key != key);
    }

    pub(crate) fn robust_push(&self, addr: usize, on_death: unsafe fn(usize, u32)) {
        self.robust.lock().push(RobustEntry { addr, on_death });
    }

    pub(crate) fn robust_remove(&self, addr: usize) {
        let mut list = self.robust.lock();
        if let Some(pos) = list.iter().rposition(|e| e.addr == addr) {
            list.remove(pos);
        }
    }

    pub fn robust_len(&self) -> usize {
        self.robust.lock().len()
    }

    /// Read-lock depth this thread holds on the rwlock at `addr`.
    pub(crate) fn read_depth(&self, addr: usize) -> u32 {
        self.read_holds
            .lock()
            .iter()
            .find(|(a, _)| *a == addr)
            .map_or(0, |(_, n)| *n)
    }

    pub(crate) fn read_acquired(&self, addr: usize) {
        let mut holds = self.read_holds.lock();
        match holds.iter_mut().find(|(a, _)| *a == addr) {
            Some((_, n)) => *n += 1,
            None => holds.push((addr, 1)),
        }
    }

    /// Forget one read hold on `addr`; false if there was none.
    pub(crate) fn read_released(&self, addr: usize) -> bool {
        let mut holds = self.read_holds.lock();
        match holds.iter().position(|(a, _)| *a == addr) {
            Some(pos) => {
                holds[pos].1 -= 1;
                if holds[pos].1 == 0 {
                    holds.swap_remove(pos);
                }
                true
            }
            None => false,
        }
    }

    /// Whether the thread is parked in a wait queue right now.
    pub fn is_blocked(&self) -> bool {
        self.parked.load(Ordering::Relaxed) != 0
    }

    /// Thread exit: every robust mutex still held is marked owner-died.
    pub(crate) fn terminate(&self) {
        self.cancelhandling
            .fetch_or(TERMINATED_BITMASK, Ordering::SeqCst);
        // Held across the hooks: a concurrent drop of a listed mutex waits in
        // `robust_remove` until its entry has been handled.
        let mut held = self.robust.lock();
        while let Some(entry) = held.pop() {
            // SAFETY: only pinned mutexes are listed. They stay in place
            // until dropped, and dropping one removes its entry under this
            // lock first.
            unsafe { (entry.on_death)(entry.addr, self.tid) };
        }
        drop(held);
        process::global().unregister(self);
    }
}

struct Slot(OnceCell<Arc<ThreadState>>);

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(state) = self.0.get() {
            state.terminate();
        }
    }
}

thread_local! {
    static CURRENT: Slot = const { Slot(OnceCell::new()) };
    static TID: Cell<u32> = const { Cell::new(0) };
}

#[cfg(target_os = "linux")]
fn fresh_tid() -> u32 {
    (crate::syscall::gettid() as u32) & FUTEX_TID_MASK
}

#[cfg(not(target_os = "linux"))]
fn fresh_tid() -> u32 {
    static NEXT: AtomicU32 = AtomicU32::new(1);
    loop {
        let tid = NEXT.fetch_add(1, Ordering::Relaxed) & FUTEX_TID_MASK;
        if tid != 0 {
            return tid;
        }
    }
}

/// State of the calling thread, created and registered on first use.
pub fn current() -> Arc<ThreadState> {
    CURRENT
        .try_with(|slot| {
            Arc::clone(slot.0.get_or_init(|| {
                let state = Arc::new(ThreadState::with_tid(fresh_tid()));
                process::global().register(&state);
                state
            }))
        })
        // Thread-local teardown already ran: hand out an unregistered state.
        .unwrap_or_else(|_| ThreadState::detached(fresh_tid()))
}

/// Owner id of the calling thread. Never zero.
pub fn current_tid() -> u32 {
    TID.try_with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        let tid = current().tid();
        cell.set(tid);
        tid
    })
    .unwrap_or_else(|_| fresh_tid())
}

#[allow(unsafe_code)]
unsafe fn wake_word<W: WaitQueue>(addr: usize, shared: bool) {
    // SAFETY: caller guarantees `addr` is a live AtomicU32.
    let word = unsafe { &*(addr as *const AtomicU32) };
    W::wake(word, WAKE_ALL, shared);
}

struct Registration<'a> {
    state: &'a ThreadState,
    cancelable: bool,
}

impl<'a> Registration<'a> {
    fn new<W: WaitQueue>(state: &'a ThreadState, word: &AtomicU32, shared: bool, cancelable: bool) -> Self {
        state.parked.fetch_add(1, Ordering::Relaxed);
        if cancelable {
            *state.blocked_on.lock() = Some(BlockedOn {
                addr: word.as_ptr() as usize,
                shared,
                wake: wake_word::<W>,
            });
        }
        Self { state, cancelable }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.cancelable {
            *self.state.blocked_on.lock() = None;
        }
        self.state.parked.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Block on `word` through `W`.
///
/// A cancelable park is a cancellation point: pending cancellation is acted
/// on right before blocking and right after waking. A wake consumed by a
/// thread that then unwinds is passed on to the next waiter.
pub(crate) fn park<W: WaitQueue>(
    word: &AtomicU32,
    expected: u32,
    deadline: Option<&Deadline>,
    shared: bool,
    cancelable: bool,
) -> WaitOutcome {
    let me = current();
    let registration = Registration::new::<W>(&me, word, shared, cancelable);
    if cancelable {
        cancel::testcancel_on(&me);
    }
    let outcome = W::wait(word, expected, deadline, shared);
    drop(registration);
    if cancelable && cancel_enabled_and_canceled(me.cancelhandling()) {
        if outcome == WaitOutcome::Woken {
            W::wake(word, 1, shared);
        }
        cancel::testcancel_on(&me);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_is_nonzero_and_stable() {
        let a = current_tid();
        assert_ne!(a, 0);
        assert_eq!(a & !FUTEX_TID_MASK, 0);
        assert_eq!(current_tid(), a);
        assert_eq!(current().tid(), a);
    }

    #[test]
    fn threads_get_distinct_ids_and_are_registered() {
        let mine = current_tid();
        let theirs = std::thread::spawn(|| {
            let tid = current_tid();
            assert!(process::global().lookup(tid).is_some());
            tid
        })
        .join()
        .unwrap();
        assert_ne!(mine, theirs);
    }

    #[test]
    fn cancel_predicate_matches_bit_layout() {
        assert!(cancel_enabled_and_canceled(CANCELED_BITMASK));
        assert!(cancel_enabled_and_canceled(
            CANCELED_BITMASK | CANCELTYPE_BITMASK | CANCELING_BITMASK
        ));
        assert!(!cancel_enabled_and_canceled(CANCELED_BITMASK | CANCELSTATE_BITMASK));
        assert!(!cancel_enabled_and_canceled(CANCELED_BITMASK | EXITING_BITMASK));
        assert!(!cancel_enabled_and_canceled(0));
    }

    #[test]
    fn effective_priority_is_max_of_base_and_boosts() {
        let t = ThreadState::detached(77);
        t.set_base_priority(5);
        assert_eq!(t.effective_priority(), 5);
        t.add_boost(0x10, 1, 20);
        t.add_boost(0x20, 0, 12);
        assert_eq!(t.effective_priority(), 20);
        t.remove_boost(0x10, 1);
        assert_eq!(t.effective_priority(), 12);
        t.remove_boosts_for(0x20);
        assert_eq!(t.effective_priority(), 5);
    }

    #[test]
    fn read_holds_nest() {
        let t = ThreadState::detached(78);
        t.read_acquired(0x40);
        t.read_acquired(0x40);
        assert_eq!(t.read_depth(0x40), 2);
        assert!(t.read_released(0x40));
        assert!(t.read_released(0x40));
        assert!(!t.read_released(0x40));
        assert_eq!(t.read_depth(0x40), 0);
    }

    #[test]
    fn cancel_of_idle_thread_only_sets_the_flag() {
        let t = ThreadState::detached(79);
        t.cancel();
        assert!(cancel_enabled_and_canceled(t.cancelhandling()));
        t.cancel();
        assert_ne!(t.cancelhandling() & CANCELING_BITMASK, 0);
    }
}
