//! POSIX condition variable.
//!
//! A waiter records the wait sequence while still holding the mutex, then
//! releases the mutex and blocks until the sequence moves. `signal` and
//! `broadcast` bump the sequence before waking, so a signal issued after the
//! waiter released the mutex is never lost. Every return path, including a
//! cancellation unwind, re-acquires the mutex first.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::mutex::{LockOutcome, MutexData};
use super::thread;
use super::waitq::{DefaultWaitQueue, WAKE_ALL, WaitOutcome, WaitQueue};
use crate::errno::SyncError;
use crate::time::{CLOCK_MONOTONIC, CLOCK_REALTIME, ClockId, Deadline, Timespec};
use crate::trace::{self, SyncFamily};

// ---------------------------------------------------------------------------
// Condition variable clock constants
// ---------------------------------------------------------------------------

/// Use CLOCK_REALTIME for condition variable timed waits (default).
pub const PTHREAD_COND_CLOCK_REALTIME: i32 = CLOCK_REALTIME;
/// Use CLOCK_MONOTONIC for condition variable timed waits.
pub const PTHREAD_COND_CLOCK_MONOTONIC: i32 = CLOCK_MONOTONIC;

/// Flag bits.
pub const COND_SHARED: u32 = 1;
pub const COND_CLOCK_MONOTONIC: u32 = 2;
const COND_DESTROYED: u32 = 1 << 31;

/// Whether `clock_id` may be selected for a condition variable.
#[must_use]
pub const fn valid_cond_clock(clock_id: i32) -> bool {
    clock_id == PTHREAD_COND_CLOCK_REALTIME || clock_id == PTHREAD_COND_CLOCK_MONOTONIC
}

/// Map unsupported clocks onto the realtime default.
#[must_use]
pub const fn sanitize_cond_clock(clock_id: i32) -> i32 {
    if valid_cond_clock(clock_id) {
        clock_id
    } else {
        PTHREAD_COND_CLOCK_REALTIME
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CondConfig {
    /// Clock that `timedwait` deadlines are measured against.
    pub clock: ClockId,
    pub pshared: bool,
}

impl CondConfig {
    #[must_use]
    pub const fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.pshared {
            flags |= COND_SHARED;
        }
        if matches!(self.clock, ClockId::Monotonic) {
            flags |= COND_CLOCK_MONOTONIC;
        }
        flags
    }

    #[must_use]
    pub const fn from_flags(flags: u32) -> Self {
        Self {
            clock: if flags & COND_CLOCK_MONOTONIC != 0 {
                ClockId::Monotonic
            } else {
                ClockId::Realtime
            },
            pshared: flags & COND_SHARED != 0,
        }
    }
}

#[repr(C)]
pub struct CondvarData<W: WaitQueue = DefaultWaitQueue> {
    seq: AtomicU32,
    nwaiters: AtomicU32,
    assoc_mutex: AtomicUsize,
    flags: AtomicU32,
    _wait: PhantomData<fn() -> W>,
}

impl<W: WaitQueue> Default for CondvarData<W> {
    fn default() -> Self {
        Self::new(CondConfig::default())
    }
}

impl<W: WaitQueue> core::fmt::Debug for CondvarData<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CondvarData")
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("nwaiters", &self.nwaiters.load(Ordering::Relaxed))
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish()
    }
}

/// Undoes a wait on every exit path. Dropped during an unwind it still
/// re-acquires the mutex, so cleanup handlers run with it held.
struct WaitGuard<'a, W: WaitQueue, MW: WaitQueue> {
    cond: &'a CondvarData<W>,
    mutex: &'a MutexData<MW>,
    saved_count: u32,
    armed: bool,
}

impl<W: WaitQueue, MW: WaitQueue> WaitGuard<'_, W, MW> {
    fn finish(mut self) -> Result<LockOutcome, SyncError> {
        self.armed = false;
        self.cond.leave();
        self.mutex.reacquire_after_wait(self.saved_count)
    }
}

impl<W: WaitQueue, MW: WaitQueue> Drop for WaitGuard<'_, W, MW> {
    fn drop(&mut self) {
        if self.armed {
            self.cond.leave();
            let _ = self.mutex.reacquire_after_wait(self.saved_count);
        }
    }
}

impl<W: WaitQueue> CondvarData<W> {
    #[must_use]
    pub const fn new(config: CondConfig) -> Self {
        Self {
            seq: AtomicU32::new(0),
            nwaiters: AtomicU32::new(0),
            assoc_mutex: AtomicUsize::new(0),
            flags: AtomicU32::new(config.flags()),
            _wait: PhantomData,
        }
    }

    /// Re-initialize in place. `Busy` while threads are waiting.
    pub fn init(&self, config: CondConfig) -> Result<(), SyncError> {
        if self.has_waiters() {
            return Err(SyncError::Busy);
        }
        self.seq.store(0, Ordering::Relaxed);
        self.assoc_mutex.store(0, Ordering::Relaxed);
        self.flags.store(config.flags(), Ordering::Release);
        Ok(())
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn flags_checked(&self) -> Result<u32, SyncError> {
        let flags = self.flags.load(Ordering::Acquire);
        if flags & COND_DESTROYED != 0 {
            return Err(SyncError::InvalidArgument);
        }
        Ok(flags)
    }

    pub fn config(&self) -> Result<CondConfig, SyncError> {
        self.flags_checked().map(CondConfig::from_flags)
    }

    pub fn has_waiters(&self) -> bool {
        self.nwaiters.load(Ordering::Acquire) > 0
    }

    /// Block until signaled. Returns with `mutex` held.
    pub fn wait<MW: WaitQueue>(&self, mutex: &MutexData<MW>) -> Result<(), SyncError> {
        self.wait_until(mutex, None)
    }

    /// Like [`CondvarData::wait`] with an absolute deadline on the clock
    /// chosen at init.
    pub fn timedwait<MW: WaitQueue>(
        &self,
        mutex: &MutexData<MW>,
        abstime: Timespec,
    ) -> Result<(), SyncError> {
        let clock = self.config()?.clock;
        self.clockwait(mutex, clock, abstime)
    }

    pub fn clockwait<MW: WaitQueue>(
        &self,
        mutex: &MutexData<MW>,
        clock: ClockId,
        abstime: Timespec,
    ) -> Result<(), SyncError> {
        let deadline = Deadline::new(clock, abstime)?;
        self.wait_until(mutex, Some(&deadline))
    }

    fn wait_until<MW: WaitQueue>(
        &self,
        mutex: &MutexData<MW>,
        deadline: Option<&Deadline>,
    ) -> Result<(), SyncError> {
        let flags = self.flags_checked()?;
        if !mutex.is_held_by_current() {
            return Err(SyncError::NotOwner);
        }
        // Both sides must live in the same address space kind.
        if mutex.config()?.pshared != (flags & COND_SHARED != 0) {
            return Err(SyncError::InvalidArgument);
        }
        let mutex_addr = mutex.addr();
        self.nwaiters.fetch_add(1, Ordering::SeqCst);
        if let Err(bound) =
            self.assoc_mutex
                .compare_exchange(0, mutex_addr, Ordering::SeqCst, Ordering::SeqCst)
        {
            if bound != mutex_addr {
                self.leave();
                return Err(SyncError::InvalidArgument);
            }
        }

        // Sampled under the mutex: any signal after the release moves it.
        let seq = self.seq.load(Ordering::SeqCst);
        let saved_count = match mutex.release_for_wait() {
            Ok(count) => count,
            Err(e) => {
                self.leave();
                return Err(e);
            }
        };
        let guard = WaitGuard {
            cond: self,
            mutex,
            saved_count,
            armed: true,
        };

        let outcome = thread::park::<W>(&self.seq, seq, deadline, flags & COND_SHARED != 0, true);
        match guard.finish()? {
            LockOutcome::Inconsistent => Err(SyncError::Inconsistent),
            LockOutcome::Acquired if outcome == WaitOutcome::TimedOut => {
                trace::record(SyncFamily::Cond, "wait", self.addr(), "timed_out");
                Err(SyncError::TimedOut)
            }
            LockOutcome::Acquired => Ok(()),
        }
    }

    /// Drop one waiter; the last one out unbinds whatever mutex is bound,
    /// which need not be its own if it was the one rejected.
    fn leave(&self) {
        if self.nwaiters.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let bound = self.assoc_mutex.load(Ordering::SeqCst);
        // A waiter that arrived meanwhile either shares the binding or was
        // rejected and will clear it on its own way out.
        if bound != 0 && self.nwaiters.load(Ordering::SeqCst) == 0 {
            let _ = self.assoc_mutex.compare_exchange(
                bound,
                0,
                Ordering::SeqCst,
                Ordering::Relaxed,
            );
        }
    }

    /// Wake at least one waiter, if any.
    pub fn signal(&self) -> Result<(), SyncError> {
        self.notify(1)
    }

    /// Wake every waiter.
    pub fn broadcast(&self) -> Result<(), SyncError> {
        self.notify(WAKE_ALL)
    }

    fn notify(&self, count: u32) -> Result<(), SyncError> {
        let flags = self.flags_checked()?;
        self.seq.fetch_add(1, Ordering::SeqCst);
        if self.has_waiters() {
            W::wake(&self.seq, count, flags & COND_SHARED != 0);
        }
        Ok(())
    }

    /// `Busy` while waiters remain.
    pub fn destroy(&self) -> Result<(), SyncError> {
        self.flags_checked()?;
        if self.has_waiters() {
            return Err(SyncError::Busy);
        }
        self.flags.fetch_or(COND_DESTROYED, Ordering::Release);
        Ok(())
    }
}
