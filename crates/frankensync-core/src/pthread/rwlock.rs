//! POSIX reader-writer lock.
//!
//! State word layout:
//!
//! ```text
//!  31        30 ............. 3    2                1           0
//! [OVERFLOW][ reader count (28b) ][WRITER_WAITING][WRLOCKED][WRPHASE]
//! ```
//!
//! - `WRPHASE`: the lock belongs to the write phase. New readers stay out.
//! - `WRLOCKED`: a writer fully holds the lock.
//! - `WRITER_WAITING`: the phase owner is waiting for active readers to drain.
//! - `OVERFLOW`: a reader found the count at its limit and queued.
//!
//! A separate writers word holds the queued-writer count plus `WRHANDOVER`,
//! set when an unlocking writer passes the phase straight to a queued writer.
//!
//! Every blocking path waits on a sequence word (`rd_seq`, `wr_seq`,
//! `wrphase_seq`). Waiters register, read the sequence, re-check the state,
//! then wait; releasers change the state, bump the sequence, then wake.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use super::thread;
use super::waitq::{DefaultWaitQueue, WAKE_ALL, WaitOutcome, WaitQueue};
use crate::errno::SyncError;
use crate::time::{ClockId, Deadline, Timespec};
use crate::trace::{self, SyncFamily};

// ---------------------------------------------------------------------------
// Preference constants
// ---------------------------------------------------------------------------

pub const PTHREAD_RWLOCK_PREFER_READER_NP: i32 = 0;
pub const PTHREAD_RWLOCK_PREFER_WRITER_NP: i32 = 1;
pub const PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP: i32 = 2;
pub const PTHREAD_RWLOCK_DEFAULT_NP: i32 = PTHREAD_RWLOCK_PREFER_READER_NP;

// ---------------------------------------------------------------------------
// Word layout
// ---------------------------------------------------------------------------

pub const RWLOCK_WRPHASE: u32 = 1;
pub const RWLOCK_WRLOCKED: u32 = 2;
pub const RWLOCK_WRITER_WAITING: u32 = 4;
pub const RWLOCK_READER_SHIFT: u32 = 3;
pub const RWLOCK_READER_OVERFLOW: u32 = 1 << 31;
const READER_ONE: u32 = 1 << RWLOCK_READER_SHIFT;
/// Largest reader count the state word can hold.
pub const RWLOCK_MAX_READERS: u32 = (RWLOCK_READER_OVERFLOW - 1) >> RWLOCK_READER_SHIFT;

pub const RWLOCK_WRHANDOVER: u32 = 1 << 31;
const WRITERS_COUNT_MASK: u32 = !RWLOCK_WRHANDOVER;

const FLAG_PREFER_READER: u32 = 1;
const FLAG_PSHARED: u32 = 2;
const FLAG_DESTROYED: u32 = 1 << 31;

/// Active readers encoded in a state word.
#[must_use]
pub const fn readers_of(state: u32) -> u32 {
    (state & !RWLOCK_READER_OVERFLOW) >> RWLOCK_READER_SHIFT
}

/// State word with one more reader, or `None` once `max_readers` is reached.
#[must_use]
pub const fn with_added_reader(state: u32, max_readers: u32) -> Option<u32> {
    if readers_of(state) >= max_readers || readers_of(state) >= RWLOCK_MAX_READERS {
        None
    } else {
        Some(state + READER_ONE)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which side wins when readers and writers contend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RwLockPreference {
    /// Phase-fair: a waiting writer closes the lock to new readers and
    /// unlocking writers hand over to queued writers.
    #[default]
    PreferWriter,
    /// Readers join whenever no writer holds the lock; writers may starve.
    PreferReader,
}

impl RwLockPreference {
    /// Map the `PTHREAD_RWLOCK_*_NP` kinds.
    pub const fn from_np(kind: i32) -> Result<Self, SyncError> {
        match kind {
            PTHREAD_RWLOCK_PREFER_READER_NP => Ok(Self::PreferReader),
            PTHREAD_RWLOCK_PREFER_WRITER_NP | PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP => {
                Ok(Self::PreferWriter)
            }
            _ => Err(SyncError::InvalidArgument),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RwLockConfig {
    pub preference: RwLockPreference,
    pub pshared: bool,
    /// Concurrent readers admitted before further readers queue.
    pub max_readers: u32,
}

impl Default for RwLockConfig {
    fn default() -> Self {
        Self {
            preference: RwLockPreference::default(),
            pshared: false,
            max_readers: RWLOCK_MAX_READERS,
        }
    }
}

impl RwLockConfig {
    pub const fn validate(&self) -> Result<(), SyncError> {
        if self.max_readers == 0 || self.max_readers > RWLOCK_MAX_READERS {
            return Err(SyncError::InvalidArgument);
        }
        Ok(())
    }

    const fn flags(&self) -> u32 {
        let mut flags = 0;
        if matches!(self.preference, RwLockPreference::PreferReader) {
            flags |= FLAG_PREFER_READER;
        }
        if self.pshared {
            flags |= FLAG_PSHARED;
        }
        flags
    }
}

/// Point-in-time view of a rwlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RwLockState {
    pub readers: u32,
    pub write_phase: bool,
    pub write_locked: bool,
    pub writer_waiting: bool,
    pub overflow: bool,
    pub handover: bool,
    pub queued_writers: u32,
    pub queued_readers: u32,
    pub writer_tid: u32,
}

enum Attempt<'a> {
    Try,
    Block(Option<&'a Deadline>),
}

impl Attempt<'_> {
    fn deadline(&self) -> Option<&Deadline> {
        match self {
            Attempt::Try => None,
            Attempt::Block(d) => *d,
        }
    }
}

#[repr(C)]
pub struct RwLockData<W: WaitQueue = DefaultWaitQueue> {
    state: AtomicU32,
    writers: AtomicU32,
    rd_waiters: AtomicU32,
    rd_seq: AtomicU32,
    wr_seq: AtomicU32,
    wrphase_seq: AtomicU32,
    cur_writer: AtomicU32,
    flags: AtomicU32,
    max_readers: AtomicU32,
    _wait: PhantomData<fn() -> W>,
}

impl<W: WaitQueue> Default for RwLockData<W> {
    fn default() -> Self {
        let cfg = RwLockConfig::default();
        Self::from_parts(cfg.flags(), cfg.max_readers)
    }
}

impl<W: WaitQueue> core::fmt::Debug for RwLockData<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RwLockData")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Decrements `rd_waiters` when a queued reader leaves, however it leaves.
struct ReaderTicket<'a>(&'a AtomicU32);

impl Drop for ReaderTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A writer counted in the writers word that has not acquired yet.
struct WriterTicket<'a, W: WaitQueue> {
    lock: &'a RwLockData<W>,
    queued: bool,
}

impl<W: WaitQueue> WriterTicket<'_, W> {
    fn dequeue(&mut self) {
        if self.queued {
            self.lock.writers.fetch_sub(1, Ordering::SeqCst);
            self.queued = false;
        }
    }
}

impl<W: WaitQueue> Drop for WriterTicket<'_, W> {
    fn drop(&mut self) {
        if self.queued {
            self.queued = false;
            self.lock.abandon_writer_queue();
        }
    }
}

/// Phase reserved by a draining writer; released unless the writer gets in.
struct PhaseReservation<'a, W: WaitQueue> {
    lock: &'a RwLockData<W>,
    armed: bool,
}

impl<W: WaitQueue> Drop for PhaseReservation<'_, W> {
    fn drop(&mut self) {
        if self.armed {
            trace::record(SyncFamily::RwLock, "wrlock", self.lock.addr(), "phase_abandoned");
            self.lock.release_phase();
        }
    }
}

impl<W: WaitQueue> RwLockData<W> {
    const fn from_parts(flags: u32, max_readers: u32) -> Self {
        Self {
            state: AtomicU32::new(0),
            writers: AtomicU32::new(0),
            rd_waiters: AtomicU32::new(0),
            rd_seq: AtomicU32::new(0),
            wr_seq: AtomicU32::new(0),
            wrphase_seq: AtomicU32::new(0),
            cur_writer: AtomicU32::new(0),
            flags: AtomicU32::new(flags),
            max_readers: AtomicU32::new(max_readers),
            _wait: PhantomData,
        }
    }

    pub fn new(config: RwLockConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self::from_parts(config.flags(), config.max_readers))
    }

    /// Re-initialize in place.
    pub fn init(&self, config: RwLockConfig) -> Result<(), SyncError> {
        config.validate()?;
        let destroyed = self.flags.load(Ordering::Relaxed) & FLAG_DESTROYED != 0;
        if !destroyed && self.in_use() {
            return Err(SyncError::Busy);
        }
        self.state.store(0, Ordering::Relaxed);
        self.writers.store(0, Ordering::Relaxed);
        self.rd_waiters.store(0, Ordering::Relaxed);
        self.cur_writer.store(0, Ordering::Relaxed);
        self.max_readers.store(config.max_readers, Ordering::Relaxed);
        self.flags.store(config.flags(), Ordering::Release);
        Ok(())
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    fn flags_checked(&self) -> Result<u32, SyncError> {
        let flags = self.flags.load(Ordering::Relaxed);
        if flags & FLAG_DESTROYED != 0 {
            return Err(SyncError::InvalidArgument);
        }
        Ok(flags)
    }

    pub fn config(&self) -> Result<RwLockConfig, SyncError> {
        let flags = self.flags_checked()?;
        Ok(RwLockConfig {
            preference: if flags & FLAG_PREFER_READER != 0 {
                RwLockPreference::PreferReader
            } else {
                RwLockPreference::PreferWriter
            },
            pshared: flags & FLAG_PSHARED != 0,
            max_readers: self.max_readers.load(Ordering::Relaxed),
        })
    }

    fn shared(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_PSHARED != 0
    }

    fn prefers_writers(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FLAG_PREFER_READER == 0
    }

    fn in_use(&self) -> bool {
        self.state.load(Ordering::SeqCst) & !RWLOCK_READER_OVERFLOW != 0
            || self.writers.load(Ordering::SeqCst) != 0
            || self.rd_waiters.load(Ordering::SeqCst) != 0
    }

    pub fn state(&self) -> RwLockState {
        let s = self.state.load(Ordering::SeqCst);
        let w = self.writers.load(Ordering::SeqCst);
        RwLockState {
            readers: readers_of(s),
            write_phase: s & RWLOCK_WRPHASE != 0,
            write_locked: s & RWLOCK_WRLOCKED != 0,
            writer_waiting: s & RWLOCK_WRITER_WAITING != 0,
            overflow: s & RWLOCK_READER_OVERFLOW != 0,
            handover: w & RWLOCK_WRHANDOVER != 0,
            queued_writers: w & WRITERS_COUNT_MASK,
            queued_readers: self.rd_waiters.load(Ordering::SeqCst),
            writer_tid: self.cur_writer.load(Ordering::Relaxed),
        }
    }

    fn held_for_write_by(&self, tid: u32) -> bool {
        self.state.load(Ordering::SeqCst) & RWLOCK_WRLOCKED != 0
            && self.cur_writer.load(Ordering::Relaxed) == tid
    }

    // -----------------------------------------------------------------------
    // Readers
    // -----------------------------------------------------------------------

    pub fn rdlock(&self) -> Result<(), SyncError> {
        self.read_acquire(Attempt::Block(None))
    }

    pub fn tryrdlock(&self) -> Result<(), SyncError> {
        self.read_acquire(Attempt::Try)
    }

    pub fn timedrdlock(&self, abstime: Timespec) -> Result<(), SyncError> {
        self.clockrdlock(ClockId::Realtime, abstime)
    }

    pub fn clockrdlock(&self, clock: ClockId, abstime: Timespec) -> Result<(), SyncError> {
        let deadline = Deadline::new(clock, abstime)?;
        self.read_acquire(Attempt::Block(Some(&deadline)))
    }

    /// Whether a reader must stay out given state `s`.
    const fn reader_blocked(s: u32, recursive: bool) -> bool {
        // A thread already reading may rejoin a phase that is still draining.
        s & RWLOCK_WRPHASE != 0 && !(recursive && s & RWLOCK_WRLOCKED == 0)
    }

    fn read_acquire(&self, attempt: Attempt<'_>) -> Result<(), SyncError> {
        self.flags_checked()?;
        let me = thread::current();
        if self.held_for_write_by(me.tid()) {
            return Err(SyncError::Deadlock);
        }
        let recursive = me.read_depth(self.addr()) > 0;
        let max = self.max_readers.load(Ordering::Relaxed);
        let deadline = attempt.deadline();

        loop {
            let s = self.state.load(Ordering::SeqCst);
            let writer_in_way = Self::reader_blocked(s, recursive);
            let mut full = false;
            if !writer_in_way {
                match with_added_reader(s, max) {
                    Some(next) => {
                        if self
                            .state
                            .compare_exchange(s, next, Ordering::SeqCst, Ordering::Relaxed)
                            .is_ok()
                        {
                            me.read_acquired(self.addr());
                            return Ok(());
                        }
                        continue;
                    }
                    None => full = true,
                }
            }

            if let Attempt::Try = attempt {
                return Err(if full { SyncError::Again } else { SyncError::Busy });
            }
            if full && s & RWLOCK_READER_OVERFLOW == 0 {
                if self
                    .state
                    .compare_exchange(
                        s,
                        s | RWLOCK_READER_OVERFLOW,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    continue;
                }
                trace::record(SyncFamily::RwLock, "rdlock", self.addr(), "overflow");
            }
            if deadline.is_some_and(Deadline::has_passed) {
                return Err(SyncError::TimedOut);
            }

            self.rd_waiters.fetch_add(1, Ordering::SeqCst);
            let ticket = ReaderTicket(&self.rd_waiters);
            let seq = self.rd_seq.load(Ordering::SeqCst);
            let s2 = self.state.load(Ordering::SeqCst);
            let still_blocked = Self::reader_blocked(s2, recursive)
                || (full && with_added_reader(s2, max).is_none());
            if still_blocked {
                let outcome =
                    thread::park::<W>(&self.rd_seq, seq, deadline, self.shared(), true);
                if outcome == WaitOutcome::TimedOut {
                    trace::record(SyncFamily::RwLock, "rdlock", self.addr(), "timed_out");
                    return Err(SyncError::TimedOut);
                }
            }
            drop(ticket);
        }
    }

    fn read_release(&self) {
        let prev = self.state.fetch_sub(READER_ONE, Ordering::SeqCst);
        let now = prev - READER_ONE;
        let shared = self.shared();
        if readers_of(now) == 0 {
            if now & RWLOCK_WRITER_WAITING != 0 {
                self.wrphase_seq.fetch_add(1, Ordering::SeqCst);
                W::wake(&self.wrphase_seq, 1, shared);
            }
            if self.writers.load(Ordering::SeqCst) & WRITERS_COUNT_MASK != 0 {
                self.wr_seq.fetch_add(1, Ordering::SeqCst);
                W::wake(&self.wr_seq, 1, shared);
            }
        }
        if prev & RWLOCK_READER_OVERFLOW != 0 {
            self.state
                .fetch_and(!RWLOCK_READER_OVERFLOW, Ordering::SeqCst);
            self.wake_readers();
        }
    }

    fn wake_readers(&self) {
        self.rd_seq.fetch_add(1, Ordering::SeqCst);
        if self.rd_waiters.load(Ordering::SeqCst) != 0 {
            W::wake(&self.rd_seq, WAKE_ALL, self.shared());
        }
    }

    // -----------------------------------------------------------------------
    // Writers
    // -----------------------------------------------------------------------

    pub fn wrlock(&self) -> Result<(), SyncError> {
        self.write_acquire(Attempt::Block(None))
    }

    pub fn trywrlock(&self) -> Result<(), SyncError> {
        self.write_acquire(Attempt::Try)
    }

    pub fn timedwrlock(&self, abstime: Timespec) -> Result<(), SyncError> {
        self.clockwrlock(ClockId::Realtime, abstime)
    }

    pub fn clockwrlock(&self, clock: ClockId, abstime: Timespec) -> Result<(), SyncError> {
        let deadline = Deadline::new(clock, abstime)?;
        self.write_acquire(Attempt::Block(Some(&deadline)))
    }

    fn write_acquire(&self, attempt: Attempt<'_>) -> Result<(), SyncError> {
        self.flags_checked()?;
        let me = thread::current();
        let tid = me.tid();
        if self.held_for_write_by(tid) {
            return Err(SyncError::Deadlock);
        }
        if me.read_depth(self.addr()) > 0 {
            return Err(SyncError::WouldDeadlock);
        }
        let deadline = attempt.deadline();
        let try_only = matches!(attempt, Attempt::Try);
        let mut ticket = WriterTicket {
            lock: self,
            queued: false,
        };
        let mut traced = false;

        loop {
            let seq = self.wr_seq.load(Ordering::SeqCst);

            // Phase handed over by the previous writer.
            let w = self.writers.load(Ordering::SeqCst);
            if w & RWLOCK_WRHANDOVER != 0 {
                let mut next = w & !RWLOCK_WRHANDOVER;
                if ticket.queued {
                    next -= 1;
                }
                if self
                    .writers
                    .compare_exchange(w, next, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    ticket.queued = false;
                    let reservation = PhaseReservation {
                        lock: self,
                        armed: true,
                    };
                    return self.drain_readers(reservation, tid, deadline);
                }
                continue;
            }

            let s = self.state.load(Ordering::SeqCst);
            if s & RWLOCK_WRPHASE == 0 {
                if readers_of(s) == 0 {
                    if self
                        .state
                        .compare_exchange(
                            s,
                            s | RWLOCK_WRPHASE | RWLOCK_WRLOCKED,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        ticket.dequeue();
                        self.cur_writer.store(tid, Ordering::Relaxed);
                        return Ok(());
                    }
                    continue;
                }
                if self.prefers_writers() && !try_only {
                    if self
                        .state
                        .compare_exchange(
                            s,
                            s | RWLOCK_WRPHASE | RWLOCK_WRITER_WAITING,
                            Ordering::SeqCst,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        ticket.dequeue();
                        let reservation = PhaseReservation {
                            lock: self,
                            armed: true,
                        };
                        return self.drain_readers(reservation, tid, deadline);
                    }
                    continue;
                }
            }

            if try_only {
                return Err(SyncError::Busy);
            }
            if deadline.is_some_and(Deadline::has_passed) {
                trace::record(SyncFamily::RwLock, "wrlock", self.addr(), "timed_out");
                return Err(SyncError::TimedOut);
            }
            if !ticket.queued {
                self.writers.fetch_add(1, Ordering::SeqCst);
                ticket.queued = true;
                continue;
            }
            if !traced {
                trace::record(SyncFamily::RwLock, "wrlock", self.addr(), "blocked");
                traced = true;
            }
            let outcome = thread::park::<W>(&self.wr_seq, seq, deadline, self.shared(), true);
            if outcome == WaitOutcome::TimedOut {
                trace::record(SyncFamily::RwLock, "wrlock", self.addr(), "timed_out");
                return Err(SyncError::TimedOut);
            }
        }
    }

    /// Holding the write phase: wait for active readers to leave, then lock.
    fn drain_readers(
        &self,
        mut reservation: PhaseReservation<'_, W>,
        tid: u32,
        deadline: Option<&Deadline>,
    ) -> Result<(), SyncError> {
        loop {
            let seq = self.wrphase_seq.load(Ordering::SeqCst);
            let s = self.state.load(Ordering::SeqCst);
            if readers_of(s) == 0 {
                let locked = (s & !RWLOCK_WRITER_WAITING) | RWLOCK_WRLOCKED;
                if self
                    .state
                    .compare_exchange(s, locked, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    reservation.armed = false;
                    self.cur_writer.store(tid, Ordering::Relaxed);
                    return Ok(());
                }
                continue;
            }
            if s & RWLOCK_WRITER_WAITING == 0 {
                // Phase came by handover and recursive readers slipped in.
                if self
                    .state
                    .compare_exchange(
                        s,
                        s | RWLOCK_WRITER_WAITING,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    continue;
                }
            }
            if deadline.is_some_and(Deadline::has_passed) {
                trace::record(SyncFamily::RwLock, "wrlock", self.addr(), "timed_out");
                return Err(SyncError::TimedOut);
            }
            let outcome = thread::park::<W>(
                &self.wrphase_seq,
                seq,
                deadline,
                self.shared(),
                true,
            );
            if outcome == WaitOutcome::TimedOut {
                trace::record(SyncFamily::RwLock, "wrlock", self.addr(), "timed_out");
                return Err(SyncError::TimedOut);
            }
        }
    }

    /// Give up the write phase: hand it to a queued writer, or open the
    /// lock to readers.
    fn release_phase(&self) {
        self.cur_writer.store(0, Ordering::Relaxed);
        let shared = self.shared();
        let queued_writers = self.writers.load(Ordering::SeqCst) & WRITERS_COUNT_MASK;
        let hand_over = queued_writers != 0
            && (self.prefers_writers() || self.rd_waiters.load(Ordering::SeqCst) == 0);
        if hand_over {
            self.state
                .fetch_and(!(RWLOCK_WRLOCKED | RWLOCK_WRITER_WAITING), Ordering::SeqCst);
            if self.offer_handover() {
                self.wr_seq.fetch_add(1, Ordering::SeqCst);
                W::wake(&self.wr_seq, 1, shared);
                trace::record(SyncFamily::RwLock, "unlock", self.addr(), "handover");
                return;
            }
        }
        self.state.fetch_and(
            !(RWLOCK_WRPHASE | RWLOCK_WRLOCKED | RWLOCK_WRITER_WAITING),
            Ordering::SeqCst,
        );
        self.wake_readers();
        self.wr_seq.fetch_add(1, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) & WRITERS_COUNT_MASK != 0 {
            W::wake(&self.wr_seq, 1, shared);
        }
    }

    /// Set `WRHANDOVER` only while a writer is still queued. The queue may
    /// empty between the decision and the flag; then the phase opens instead.
    fn offer_handover(&self) -> bool {
        let mut w = self.writers.load(Ordering::SeqCst);
        loop {
            if w & WRITERS_COUNT_MASK == 0 {
                return false;
            }
            match self.writers.compare_exchange_weak(
                w,
                w | RWLOCK_WRHANDOVER,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(cur) => w = cur,
            }
        }
    }

    /// A queued writer leaves without the lock (timeout or cancellation).
    fn abandon_writer_queue(&self) {
        let prev = self.writers.fetch_sub(1, Ordering::SeqCst);
        if prev & RWLOCK_WRHANDOVER != 0 {
            // The phase may have been handed to us; claim it and pass it on.
            let mut w = prev - 1;
            while w & RWLOCK_WRHANDOVER != 0 {
                match self.writers.compare_exchange_weak(
                    w,
                    w & !RWLOCK_WRHANDOVER,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        self.release_phase();
                        return;
                    }
                    Err(cur) => w = cur,
                }
            }
        }
        // We may have consumed the wake meant for another writer.
        self.wr_seq.fetch_add(1, Ordering::SeqCst);
        if self.writers.load(Ordering::SeqCst) & WRITERS_COUNT_MASK != 0 {
            W::wake(&self.wr_seq, 1, self.shared());
        }
    }

    // -----------------------------------------------------------------------
    // Release / destroy
    // -----------------------------------------------------------------------

    /// Release whichever mode the caller holds.
    pub fn unlock(&self) -> Result<(), SyncError> {
        self.flags_checked()?;
        let me = thread::current();
        if self.held_for_write_by(me.tid()) {
            self.release_phase();
            return Ok(());
        }
        if me.read_released(self.addr()) {
            self.read_release();
            return Ok(());
        }
        Err(SyncError::NotOwner)
    }

    /// `Busy` while held or waited on.
    pub fn destroy(&self) -> Result<(), SyncError> {
        self.flags_checked()?;
        if self.in_use() {
            return Err(SyncError::Busy);
        }
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::Relaxed);
        Ok(())
    }
}
