//! POSIX mutex.
//!
//! Configuration lives in a packed kind word fixed at `init`; the mutable
//! state lives in a separate lock word holding the owner id plus the
//! `FUTEX_WAITERS` and `FUTEX_OWNER_DIED` bits. One algorithm serves every
//! kind, parameterized by the unpacked [`MutexConfig`]:
//!
//! - recursive: a holder-owned counter counts re-acquisitions
//! - error-checking and robust: self-relock is `Deadlock`, release checks the owner
//! - adaptive: bounded spinning before blocking, cut short when the owner is parked
//! - priority-inherit: a blocked waiter boosts the owner until the owner releases
//! - priority-protect: the holder runs at the ceiling for the critical section
//! - robust: a dead owner leaves `FUTEX_OWNER_DIED`; the next acquirer gets
//!   [`LockOutcome::Inconsistent`] and must call `make_consistent`, or the
//!   mutex becomes permanently not-recoverable

use core::marker::{PhantomData, PhantomPinned};
use core::pin::Pin;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::process;
use super::thread::{self, FUTEX_TID_MASK, ThreadState};
use super::waitq::{DefaultWaitQueue, WAKE_ALL, WaitOutcome, WaitQueue};
use crate::config;
use crate::errno::SyncError;
use crate::time::{ClockId, Deadline, Timespec};
use crate::trace::{self, SyncFamily};

// ---------------------------------------------------------------------------
// Kind word layout
// ---------------------------------------------------------------------------

pub const PTHREAD_MUTEX_NORMAL: u32 = 0;
pub const PTHREAD_MUTEX_RECURSIVE: u32 = 1;
pub const PTHREAD_MUTEX_ERRORCHECK: u32 = 2;
pub const PTHREAD_MUTEX_ADAPTIVE_NP: u32 = 3;
pub const PTHREAD_MUTEX_DEFAULT: u32 = PTHREAD_MUTEX_NORMAL;
pub const PTHREAD_MUTEX_KIND_MASK_NP: u32 = 3;

pub const PTHREAD_MUTEX_ROBUST_NORMAL_NP: u32 = 16;
pub const PTHREAD_MUTEX_PRIO_INHERIT_NP: u32 = 32;
pub const PTHREAD_MUTEX_PRIO_PROTECT_NP: u32 = 64;
pub const PTHREAD_MUTEX_PSHARED_BIT: u32 = 128;
pub const PTHREAD_MUTEX_ELISION_NP: u32 = 256;
pub const PTHREAD_MUTEX_NO_ELISION_NP: u32 = 512;

pub const PTHREAD_MUTEX_PRIO_CEILING_SHIFT: u32 = 12;
pub const PTHREAD_MUTEX_PRIO_CEILING_MASK: u32 = 0x00ff_f000;
pub const MAX_PRIO_CEILING: u32 = PTHREAD_MUTEX_PRIO_CEILING_MASK >> PTHREAD_MUTEX_PRIO_CEILING_SHIFT;

/// Set in the kind word once the mutex is destroyed.
const MUTEX_DESTROYED: u32 = 0x8000_0000;
/// Set in the kind word of mutexes built by [`MutexData::new_pinned`].
/// Only those may be robust.
const MUTEX_PINNED: u32 = 0x4000_0000;

// ---------------------------------------------------------------------------
// Lock word layout
// ---------------------------------------------------------------------------

pub const FUTEX_WAITERS: u32 = 0x8000_0000;
pub const FUTEX_OWNER_DIED: u32 = 0x4000_0000;

/// Owner field sentinels for robust mutexes.
pub const PTHREAD_MUTEX_INCONSISTENT: u32 = i32::MAX as u32;
pub const PTHREAD_MUTEX_NOTRECOVERABLE: u32 = (i32::MAX - 1) as u32;

/// Lock word of a not-recoverable mutex: looks held by nobody real.
const LOCK_NOTRECOVERABLE: u32 = FUTEX_TID_MASK;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MutexKind {
    #[default]
    Normal,
    Recursive,
    ErrorCheck,
    Adaptive,
}

impl MutexKind {
    const fn bits(self) -> u32 {
        match self {
            Self::Normal => PTHREAD_MUTEX_NORMAL,
            Self::Recursive => PTHREAD_MUTEX_RECURSIVE,
            Self::ErrorCheck => PTHREAD_MUTEX_ERRORCHECK,
            Self::Adaptive => PTHREAD_MUTEX_ADAPTIVE_NP,
        }
    }

    const fn from_bits(bits: u32) -> Self {
        match bits & PTHREAD_MUTEX_KIND_MASK_NP {
            PTHREAD_MUTEX_RECURSIVE => Self::Recursive,
            PTHREAD_MUTEX_ERRORCHECK => Self::ErrorCheck,
            PTHREAD_MUTEX_ADAPTIVE_NP => Self::Adaptive,
            _ => Self::Normal,
        }
    }
}

/// Priority protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    None,
    Inherit,
    /// Priority ceiling.
    Protect(u32),
}

/// Resolved mutex configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MutexConfig {
    pub kind: MutexKind,
    pub robust: bool,
    pub protocol: Protocol,
    pub pshared: bool,
    /// Advisory only; never changes observable behavior.
    pub elision: bool,
}

impl MutexConfig {
    #[must_use]
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            robust: false,
            protocol: Protocol::None,
            pshared: false,
            elision: false,
        }
    }

    #[must_use]
    pub const fn robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    #[must_use]
    pub const fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn pshared(mut self, pshared: bool) -> Self {
        self.pshared = pshared;
        self
    }

    #[must_use]
    pub const fn elision(mut self, elision: bool) -> Self {
        self.elision = elision;
        self
    }

    /// Rejects ceilings that do not fit the kind word.
    pub const fn validate(&self) -> Result<(), SyncError> {
        match self.protocol {
            Protocol::Protect(ceiling) if ceiling > MAX_PRIO_CEILING => {
                Err(SyncError::InvalidArgument)
            }
            _ => Ok(()),
        }
    }

    /// Pack into the kind word. Assumes [`MutexConfig::validate`] passed.
    #[must_use]
    pub const fn pack(&self) -> u32 {
        let mut word = self.kind.bits();
        if self.robust {
            word |= PTHREAD_MUTEX_ROBUST_NORMAL_NP;
        }
        match self.protocol {
            Protocol::None => {}
            Protocol::Inherit => word |= PTHREAD_MUTEX_PRIO_INHERIT_NP,
            Protocol::Protect(ceiling) => {
                word |= PTHREAD_MUTEX_PRIO_PROTECT_NP
                    | ((ceiling << PTHREAD_MUTEX_PRIO_CEILING_SHIFT)
                        & PTHREAD_MUTEX_PRIO_CEILING_MASK);
            }
        }
        if self.pshared {
            word |= PTHREAD_MUTEX_PSHARED_BIT;
        }
        word |= if self.elision {
            PTHREAD_MUTEX_ELISION_NP
        } else {
            PTHREAD_MUTEX_NO_ELISION_NP
        };
        word
    }

    #[must_use]
    pub const fn unpack(word: u32) -> Self {
        let protocol = if word & PTHREAD_MUTEX_PRIO_INHERIT_NP != 0 {
            Protocol::Inherit
        } else if word & PTHREAD_MUTEX_PRIO_PROTECT_NP != 0 {
            Protocol::Protect(
                (word & PTHREAD_MUTEX_PRIO_CEILING_MASK) >> PTHREAD_MUTEX_PRIO_CEILING_SHIFT,
            )
        } else {
            Protocol::None
        };
        Self {
            kind: MutexKind::from_bits(word),
            robust: word & PTHREAD_MUTEX_ROBUST_NORMAL_NP != 0,
            protocol,
            pshared: word & PTHREAD_MUTEX_PSHARED_BIT != 0,
            elision: word & PTHREAD_MUTEX_ELISION_NP != 0
                && word & PTHREAD_MUTEX_NO_ELISION_NP == 0,
        }
    }

    /// Kinds whose unlock verifies the caller holds the lock.
    const fn checks_owner(&self) -> bool {
        matches!(self.kind, MutexKind::Recursive | MutexKind::ErrorCheck)
            || self.robust
            || !matches!(self.protocol, Protocol::None)
    }
}

// ---------------------------------------------------------------------------
// Mutex data
// ---------------------------------------------------------------------------

/// Result of a successful acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Acquired a robust mutex whose previous owner died holding it.
    Inconsistent,
}

/// Point-in-time view of a mutex, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MutexState {
    pub owner_tid: u32,
    pub waiters: bool,
    pub owner_died: bool,
    pub inconsistent: bool,
    pub not_recoverable: bool,
    pub recursion: u32,
    pub destroyed: bool,
}

enum Attempt<'a> {
    Try,
    Block(Option<&'a Deadline>),
}

/// Mutex laid out as plain words so it can live in shared memory.
///
/// A held robust mutex is reachable from its owner's robust list by
/// address, so robust mutexes only come pinned from
/// [`MutexData::new_pinned`]; [`MutexData::new`] and [`MutexData::init`]
/// refuse a robust configuration on an unpinned mutex.
#[repr(C)]
pub struct MutexData<W: WaitQueue = DefaultWaitQueue> {
    lock: AtomicU32,
    count: AtomicU32,
    owner: AtomicU32,
    kind: AtomicU32,
    spins: AtomicU32,
    _wait: PhantomData<fn() -> W>,
    _pinned: PhantomPinned,
}

impl<W: WaitQueue> Default for MutexData<W> {
    fn default() -> Self {
        Self::from_kind_word(MutexConfig::new(MutexKind::Normal).pack())
    }
}

impl<W: WaitQueue> core::fmt::Debug for MutexData<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MutexData")
            .field("config", &MutexConfig::unpack(self.kind.load(Ordering::Relaxed)))
            .field("state", &self.state())
            .finish()
    }
}

#[allow(unsafe_code)]
unsafe fn on_owner_death<W: WaitQueue>(addr: usize, tid: u32) {
    // SAFETY: robust list entries come from `finish_acquire` on a mutex
    // carrying MUTEX_PINNED, which cannot move, and whose drop removes the
    // entry before the memory goes away.
    let mutex = unsafe { &*(addr as *const MutexData<W>) };
    mutex.mark_owner_died(tid);
}

struct InheritBoost {
    owner: Arc<ThreadState>,
    key: usize,
    source: u32,
}

impl Drop for InheritBoost {
    fn drop(&mut self) {
        self.owner.remove_boost(self.key, self.source);
    }
}

/// Ceiling boost taken before acquisition; undone unless the lock is won.
struct CeilingBoost {
    holder: Option<(Arc<ThreadState>, usize)>,
}

impl CeilingBoost {
    fn keep(mut self) {
        self.holder = None;
    }
}

impl Drop for CeilingBoost {
    fn drop(&mut self) {
        if let Some((state, key)) = self.holder.take() {
            state.remove_boost(key, 0);
        }
    }
}

impl<W: WaitQueue> MutexData<W> {
    const fn from_kind_word(kind: u32) -> Self {
        Self {
            lock: AtomicU32::new(0),
            count: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            kind: AtomicU32::new(kind),
            spins: AtomicU32::new(0),
            _wait: PhantomData,
            _pinned: PhantomPinned,
        }
    }

    /// Unlocked mutex with `config`. Robust configurations need a fixed
    /// address and are refused here with `InvalidArgument`; use
    /// [`MutexData::new_pinned`].
    pub fn new(config: MutexConfig) -> Result<Self, SyncError> {
        config.validate()?;
        if config.robust {
            return Err(SyncError::InvalidArgument);
        }
        Ok(Self::from_kind_word(config.pack()))
    }

    /// Unlocked mutex with `config` at a fixed heap address. Accepts every
    /// configuration, robust included.
    pub fn new_pinned(config: MutexConfig) -> Result<Pin<Box<Self>>, SyncError> {
        config.validate()?;
        Ok(Box::pin(Self::from_kind_word(config.pack() | MUTEX_PINNED)))
    }

    /// Re-initialize in place (after `destroy`, or over fresh shared memory).
    /// Robust configurations are only accepted on a pinned mutex.
    pub fn init(&self, config: MutexConfig) -> Result<(), SyncError> {
        config.validate()?;
        let pinned = self.kind.load(Ordering::Relaxed) & MUTEX_PINNED;
        if config.robust && pinned == 0 {
            return Err(SyncError::InvalidArgument);
        }
        let holder = self.lock.load(Ordering::Acquire) & FUTEX_TID_MASK;
        let destroyed = self.kind.load(Ordering::Relaxed) & MUTEX_DESTROYED != 0;
        if !destroyed && holder != 0 && holder != LOCK_NOTRECOVERABLE {
            return Err(SyncError::Busy);
        }
        self.count.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Relaxed);
        self.spins.store(0, Ordering::Relaxed);
        self.kind.store(config.pack() | pinned, Ordering::Relaxed);
        self.lock.store(0, Ordering::Release);
        Ok(())
    }

    pub(crate) fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// The configuration this mutex was initialized with.
    pub fn config(&self) -> Result<MutexConfig, SyncError> {
        let word = self.kind.load(Ordering::Relaxed);
        if word & MUTEX_DESTROYED != 0 {
            return Err(SyncError::InvalidArgument);
        }
        Ok(MutexConfig::unpack(word))
    }

    pub fn state(&self) -> MutexState {
        let word = self.lock.load(Ordering::Acquire);
        let owner = self.owner.load(Ordering::Relaxed);
        let not_recoverable = owner == PTHREAD_MUTEX_NOTRECOVERABLE;
        MutexState {
            owner_tid: if not_recoverable { 0 } else { word & FUTEX_TID_MASK },
            waiters: word & FUTEX_WAITERS != 0,
            owner_died: word & FUTEX_OWNER_DIED != 0,
            inconsistent: owner == PTHREAD_MUTEX_INCONSISTENT,
            not_recoverable,
            recursion: self.count.load(Ordering::Relaxed),
            destroyed: self.kind.load(Ordering::Relaxed) & MUTEX_DESTROYED != 0,
        }
    }

    /// True when the calling thread holds the lock.
    pub fn is_held_by_current(&self) -> bool {
        self.lock.load(Ordering::Relaxed) & FUTEX_TID_MASK == thread::current_tid()
    }

    pub fn lock(&self) -> Result<LockOutcome, SyncError> {
        self.acquire(Attempt::Block(None), true)
    }

    pub fn trylock(&self) -> Result<LockOutcome, SyncError> {
        self.acquire(Attempt::Try, false)
    }

    /// Lock with an absolute `CLOCK_REALTIME` deadline.
    pub fn timedlock(&self, abstime: Timespec) -> Result<LockOutcome, SyncError> {
        self.clocklock(ClockId::Realtime, abstime)
    }

    /// Lock with an absolute deadline on `clock`. A deadline already in the
    /// past still makes one non-blocking attempt.
    pub fn clocklock(&self, clock: ClockId, abstime: Timespec) -> Result<LockOutcome, SyncError> {
        let deadline = Deadline::new(clock, abstime)?;
        self.acquire(Attempt::Block(Some(&deadline)), true)
    }

    fn acquire(&self, attempt: Attempt<'_>, cancelable: bool) -> Result<LockOutcome, SyncError> {
        let cfg = self.config()?;
        let tid = thread::current_tid();

        if self.lock.load(Ordering::Relaxed) & FUTEX_TID_MASK == tid {
            match cfg.kind {
                MutexKind::Recursive => {
                    let count = self.count.load(Ordering::Relaxed);
                    if count == u32::MAX {
                        return Err(SyncError::Again);
                    }
                    self.count.store(count + 1, Ordering::Relaxed);
                    return Ok(LockOutcome::Acquired);
                }
                MutexKind::ErrorCheck => return Err(SyncError::Deadlock),
                _ if cfg.robust => return Err(SyncError::Deadlock),
                // Normal and adaptive self-relock simply waits on itself.
                _ => {}
            }
        }
        if cfg.robust && self.owner.load(Ordering::SeqCst) == PTHREAD_MUTEX_NOTRECOVERABLE {
            return Err(SyncError::NotRecoverable);
        }

        let ceiling = self.enter_ceiling(&cfg)?;
        let died = match attempt {
            Attempt::Try => self.try_acquire_word(tid).ok_or(SyncError::Busy)?,
            Attempt::Block(deadline) => self.acquire_slow(&cfg, tid, deadline, cancelable)?,
        };
        ceiling.keep();
        Ok(self.finish_acquire(&cfg, tid, died))
    }

    /// One CAS attempt on a free word. `Some(owner_died)` on success.
    fn try_acquire_word(&self, tid: u32) -> Option<bool> {
        let mut cur = self.lock.load(Ordering::Relaxed);
        loop {
            if cur & FUTEX_TID_MASK != 0 {
                return None;
            }
            let new = tid | (cur & FUTEX_WAITERS);
            match self
                .lock
                .compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Some(cur & FUTEX_OWNER_DIED != 0),
                Err(actual) => cur = actual,
            }
        }
    }

    fn acquire_slow(
        &self,
        cfg: &MutexConfig,
        tid: u32,
        deadline: Option<&Deadline>,
        cancelable: bool,
    ) -> Result<bool, SyncError> {
        if let Some(died) = self.try_acquire_word(tid) {
            return Ok(died);
        }
        let spin = cfg.kind == MutexKind::Adaptive || (cfg.elision && config::elision_enabled());
        if spin {
            if let Some(died) = self.spin(tid) {
                return Ok(died);
            }
        }

        let mut traced = false;
        loop {
            if cfg.robust && self.owner.load(Ordering::SeqCst) == PTHREAD_MUTEX_NOTRECOVERABLE {
                return Err(SyncError::NotRecoverable);
            }
            let cur = self.lock.load(Ordering::Relaxed);
            if cur & FUTEX_TID_MASK == 0 {
                // Having contended, we may not be the last waiter: keep the bit.
                let new = tid | FUTEX_WAITERS;
                if self
                    .lock
                    .compare_exchange(cur, new, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(cur & FUTEX_OWNER_DIED != 0);
                }
                continue;
            }
            if deadline.is_some_and(Deadline::has_passed) {
                trace::record(SyncFamily::Mutex, "lock", self.addr(), "timed_out");
                return Err(SyncError::TimedOut);
            }
            let expected = cur | FUTEX_WAITERS;
            if cur & FUTEX_WAITERS == 0
                && self
                    .lock
                    .compare_exchange(cur, expected, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }
            if !traced {
                trace::record(SyncFamily::Mutex, "lock", self.addr(), "blocked");
                traced = true;
            }
            let boost = self.inherit_boost(cfg, cur & FUTEX_TID_MASK);
            let outcome = thread::park::<W>(&self.lock, expected, deadline, cfg.pshared, cancelable);
            drop(boost);
            if outcome == WaitOutcome::TimedOut {
                trace::record(SyncFamily::Mutex, "lock", self.addr(), "timed_out");
                return Err(SyncError::TimedOut);
            }
        }
    }

    /// Adaptive spin. The bound tracks how long recent acquisitions spun.
    fn spin(&self, tid: u32) -> Option<bool> {
        let max = config::spin_count() as i32;
        let spins = self.spins.load(Ordering::Relaxed) as i32;
        let bound = max.min(spins * 2 + 10);
        let mut cnt = 0;
        let mut won = None;
        while cnt < bound {
            if let Some(died) = self.try_acquire_word(tid) {
                won = Some(died);
                break;
            }
            if cnt % 16 == 15 && self.owner_is_parked() {
                break;
            }
            core::hint::spin_loop();
            cnt += 1;
        }
        self.spins
            .store((spins + (cnt - spins) / 8) as u32, Ordering::Relaxed);
        won
    }

    fn owner_is_parked(&self) -> bool {
        let holder = self.lock.load(Ordering::Relaxed) & FUTEX_TID_MASK;
        holder != 0
            && process::global()
                .lookup(holder)
                .is_some_and(|owner| owner.is_blocked())
    }

    fn inherit_boost(&self, cfg: &MutexConfig, owner_tid: u32) -> Option<InheritBoost> {
        if cfg.protocol != Protocol::Inherit {
            return None;
        }
        let me = thread::current();
        let priority = me.effective_priority();
        let owner = process::global().lookup(owner_tid)?;
        if owner.effective_priority() >= priority {
            return None;
        }
        owner.add_boost(self.addr(), me.tid(), priority);
        Some(InheritBoost {
            owner,
            key: self.addr(),
            source: me.tid(),
        })
    }

    fn enter_ceiling(&self, cfg: &MutexConfig) -> Result<CeilingBoost, SyncError> {
        let Protocol::Protect(ceiling) = cfg.protocol else {
            return Ok(CeilingBoost { holder: None });
        };
        let me = thread::current();
        if me.effective_priority() > ceiling as i32 {
            return Err(SyncError::ProtocolViolation);
        }
        me.add_boost(self.addr(), 0, ceiling as i32);
        Ok(CeilingBoost {
            holder: Some((me, self.addr())),
        })
    }

    fn finish_acquire(&self, cfg: &MutexConfig, tid: u32, owner_died: bool) -> LockOutcome {
        self.count.store(0, Ordering::Relaxed);
        if cfg.robust {
            thread::current().robust_push(self.addr(), on_owner_death::<W>);
            if owner_died {
                self.owner
                    .store(PTHREAD_MUTEX_INCONSISTENT, Ordering::SeqCst);
                trace::record(SyncFamily::Mutex, "lock", self.addr(), "owner_died");
                return LockOutcome::Inconsistent;
            }
        }
        self.owner.store(tid, Ordering::Relaxed);
        LockOutcome::Acquired
    }

    pub fn unlock(&self) -> Result<(), SyncError> {
        let cfg = self.config()?;
        let tid = thread::current_tid();
        if cfg.checks_owner() && self.lock.load(Ordering::Relaxed) & FUTEX_TID_MASK != tid {
            return Err(SyncError::NotOwner);
        }
        if cfg.kind == MutexKind::Recursive {
            let count = self.count.load(Ordering::Relaxed);
            if count > 0 {
                self.count.store(count - 1, Ordering::Relaxed);
                return Ok(());
            }
        }
        self.release(&cfg);
        Ok(())
    }

    fn release(&self, cfg: &MutexConfig) {
        let addr = self.addr();
        if cfg.robust {
            thread::current().robust_remove(addr);
        }
        if cfg.robust && self.owner.load(Ordering::SeqCst) == PTHREAD_MUTEX_INCONSISTENT {
            self.owner
                .store(PTHREAD_MUTEX_NOTRECOVERABLE, Ordering::SeqCst);
            self.lock.swap(LOCK_NOTRECOVERABLE, Ordering::SeqCst);
            W::wake(&self.lock, WAKE_ALL, cfg.pshared);
            trace::record(SyncFamily::Mutex, "unlock", addr, "not_recoverable");
        } else {
            self.owner.store(0, Ordering::Relaxed);
            let prev = self.lock.swap(0, Ordering::SeqCst);
            if prev & FUTEX_WAITERS != 0 {
                W::wake(&self.lock, 1, cfg.pshared);
            }
        }
        if cfg.protocol != Protocol::None {
            thread::current().remove_boosts_for(addr);
        }
    }

    /// Mark an inconsistent robust mutex consistent again.
    pub fn make_consistent(&self) -> Result<(), SyncError> {
        let cfg = self.config()?;
        if !cfg.robust {
            return Err(SyncError::InvalidArgument);
        }
        let tid = thread::current_tid();
        if self.lock.load(Ordering::Relaxed) & FUTEX_TID_MASK != tid {
            return Err(SyncError::NotOwner);
        }
        if self
            .owner
            .compare_exchange(
                PTHREAD_MUTEX_INCONSISTENT,
                tid,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return Err(SyncError::InvalidArgument);
        }
        Ok(())
    }

    /// Alias of [`MutexData::make_consistent`].
    pub fn consistent(&self) -> Result<(), SyncError> {
        self.make_consistent()
    }

    /// Termination notification: the thread `tid` died. If it held this
    /// robust mutex, the lock is freed with `FUTEX_OWNER_DIED` set and one
    /// waiter is woken. Returns whether the mark was applied.
    pub fn owner_terminated(&self, tid: u32) -> bool {
        let marked = self.mark_owner_died(tid);
        if marked {
            if let Some(owner) = process::global().lookup(tid) {
                owner.robust_remove(self.addr());
            }
        }
        marked
    }

    /// The lock-word half of [`MutexData::owner_terminated`]; leaves the
    /// owner's robust list alone.
    fn mark_owner_died(&self, tid: u32) -> bool {
        let Ok(cfg) = self.config() else {
            return false;
        };
        if !cfg.robust || tid == 0 {
            return false;
        }
        let mut cur = self.lock.load(Ordering::SeqCst);
        loop {
            if cur & FUTEX_TID_MASK != tid {
                return false;
            }
            let new = (cur & FUTEX_WAITERS) | FUTEX_OWNER_DIED;
            match self
                .lock
                .compare_exchange(cur, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        self.count.store(0, Ordering::Relaxed);
        if cur & FUTEX_WAITERS != 0 {
            W::wake(&self.lock, 1, cfg.pshared);
        }
        trace::record(SyncFamily::Mutex, "owner_terminated", self.addr(), "owner_died");
        true
    }

    pub fn prioceiling(&self) -> Result<u32, SyncError> {
        match self.config()?.protocol {
            Protocol::Protect(ceiling) => Ok(ceiling),
            _ => Err(SyncError::InvalidArgument),
        }
    }

    /// Change the priority ceiling, taking the lock if the caller does not
    /// already hold it. Returns the previous ceiling.
    pub fn set_prioceiling(&self, ceiling: u32) -> Result<u32, SyncError> {
        let Protocol::Protect(old) = self.config()?.protocol else {
            return Err(SyncError::InvalidArgument);
        };
        if ceiling > MAX_PRIO_CEILING {
            return Err(SyncError::InvalidArgument);
        }
        let held = self.is_held_by_current();
        if !held {
            self.acquire(Attempt::Block(None), false)?;
        }
        let mut word = self.kind.load(Ordering::Relaxed);
        loop {
            let new = (word & !PTHREAD_MUTEX_PRIO_CEILING_MASK)
                | (ceiling << PTHREAD_MUTEX_PRIO_CEILING_SHIFT);
            match self
                .kind
                .compare_exchange_weak(word, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => word = actual,
            }
        }
        if held {
            thread::current().add_boost(self.addr(), 0, ceiling as i32);
        } else {
            self.unlock()?;
        }
        Ok(old)
    }

    /// `Busy` while locked; afterwards every operation fails `InvalidArgument`
    /// until the next `init`.
    pub fn destroy(&self) -> Result<(), SyncError> {
        let cfg = self.config()?;
        let holder = self.lock.load(Ordering::Acquire) & FUTEX_TID_MASK;
        let not_recoverable = cfg.robust && holder == LOCK_NOTRECOVERABLE;
        if holder != 0 && !not_recoverable {
            return Err(SyncError::Busy);
        }
        self.kind.fetch_or(MUTEX_DESTROYED, Ordering::Relaxed);
        Ok(())
    }

    /// Fully release for a condition-variable wait. Returns the recursion
    /// count to restore afterwards.
    pub(crate) fn release_for_wait(&self) -> Result<u32, SyncError> {
        let cfg = self.config()?;
        if !self.is_held_by_current() {
            return Err(SyncError::NotOwner);
        }
        let saved = self.count.swap(0, Ordering::Relaxed);
        self.release(&cfg);
        Ok(saved)
    }

    /// Re-acquire after a condition-variable wait. Not a cancellation point.
    pub(crate) fn reacquire_after_wait(&self, saved: u32) -> Result<LockOutcome, SyncError> {
        let outcome = self.acquire(Attempt::Block(None), false)?;
        self.count.store(saved, Ordering::Relaxed);
        Ok(outcome)
    }
}

impl<W: WaitQueue> Drop for MutexData<W> {
    fn drop(&mut self) {
        let kind = *self.kind.get_mut();
        let holder = *self.lock.get_mut() & FUTEX_TID_MASK;
        if kind & PTHREAD_MUTEX_ROBUST_NORMAL_NP == 0 || holder == 0 || holder == LOCK_NOTRECOVERABLE {
            return;
        }
        if let Some(owner) = process::global().lookup(holder) {
            owner.robust_remove(self.addr());
        }
    }
}
