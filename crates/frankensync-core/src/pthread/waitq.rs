//! Wait/wake on a 32-bit word.
//!
//! Every blocking path in the sync core funnels through [`WaitQueue`]:
//! block while the word still holds the expected value, until woken or until
//! an absolute deadline passes. Two implementations are provided:
//!
//! - [`Futex`]: the Linux kernel facility (`FUTEX_WAIT_BITSET` / `FUTEX_WAKE`).
//!   Private addressing unless the object is process-shared.
//! - [`Emulated`]: hashed in-process wait buckets. Single-process only.
//!
//! Contract shared by both: the value comparison and the enqueue are atomic
//! with respect to `wake`, so a waker that changes the word and then calls
//! `wake` can never be missed.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::time::{ClockId, Deadline};

/// Wake count meaning "everyone".
pub const WAKE_ALL: u32 = i32::MAX as u32;

/// Why a wait returned. Callers always re-check their word afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    /// The word no longer held the expected value; nothing blocked.
    ValueChanged,
    TimedOut,
    /// A signal interrupted the wait.
    Interrupted,
}

/// Block/wake facility keyed by the address of a 32-bit word.
pub trait WaitQueue: 'static {
    /// Block while `*word == expected`.
    fn wait(word: &AtomicU32, expected: u32, deadline: Option<&Deadline>, shared: bool)
    -> WaitOutcome;

    /// Wake up to `count` threads blocked on `word`; returns how many woke.
    fn wake(word: &AtomicU32, count: u32, shared: bool) -> usize;
}

/// Kernel futex wait queue.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Futex;

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
impl WaitQueue for Futex {
    fn wait(
        word: &AtomicU32,
        expected: u32,
        deadline: Option<&Deadline>,
        shared: bool,
    ) -> WaitOutcome {
        use crate::errno;
        let abstime = deadline.map(|d| (d.abstime, d.clock == ClockId::Realtime));
        // SAFETY: `word` is a live, aligned AtomicU32 borrowed for the call.
        match unsafe { crate::syscall::futex_wait_abs(word.as_ptr(), expected, abstime, shared) } {
            Ok(()) => WaitOutcome::Woken,
            Err(e) if e == errno::EAGAIN => WaitOutcome::ValueChanged,
            Err(e) if e == errno::ETIMEDOUT => WaitOutcome::TimedOut,
            Err(e) if e == errno::EINTR => WaitOutcome::Interrupted,
            // Anything else is treated as a spurious wake; callers re-check.
            Err(_) => WaitOutcome::Woken,
        }
    }

    fn wake(word: &AtomicU32, count: u32, shared: bool) -> usize {
        // SAFETY: `word` is a live, aligned AtomicU32 borrowed for the call.
        unsafe { crate::syscall::futex_wake(word.as_ptr(), count, shared) }
    }
}

/// In-process wait queue: a fixed table of hashed buckets, each a FIFO of
/// parked waiters. The `shared` flag is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Emulated;

const BUCKET_COUNT: usize = 64;

#[derive(Default)]
struct Parker {
    woken: Mutex<bool>,
    cv: Condvar,
}

struct Waiter {
    addr: usize,
    parker: Arc<Parker>,
}

struct Bucket {
    queue: Mutex<Vec<Waiter>>,
}

static BUCKETS: [Bucket; BUCKET_COUNT] = [const {
    Bucket {
        queue: parking_lot::const_mutex(Vec::new()),
    }
}; BUCKET_COUNT];

fn bucket_for(addr: usize) -> &'static Bucket {
    // Fibonacci hashing; words are at least 4-byte aligned.
    let h = (addr >> 2).wrapping_mul(0x9E37_79B9_7F4A_7C15_u64 as usize);
    &BUCKETS[h >> (usize::BITS - BUCKET_COUNT.trailing_zeros())]
}

impl WaitQueue for Emulated {
    fn wait(
        word: &AtomicU32,
        expected: u32,
        deadline: Option<&Deadline>,
        _shared: bool,
    ) -> WaitOutcome {
        let addr = word.as_ptr() as usize;
        let bucket = bucket_for(addr);
        let parker = Arc::new(Parker::default());
        {
            let mut queue = bucket.queue.lock();
            if word.load(Ordering::SeqCst) != expected {
                return WaitOutcome::ValueChanged;
            }
            queue.push(Waiter {
                addr,
                parker: Arc::clone(&parker),
            });
        }

        let mut woken = parker.woken.lock();
        loop {
            if *woken {
                return WaitOutcome::Woken;
            }
            let remaining = match deadline {
                None => {
                    parker.cv.wait(&mut woken);
                    continue;
                }
                Some(d) => d.remaining(),
            };
            match remaining {
                Some(dur) => {
                    let _ = parker.cv.wait_for(&mut woken, dur);
                }
                None => {
                    drop(woken);
                    let mut queue = bucket.queue.lock();
                    if let Some(pos) = queue.iter().position(|w| Arc::ptr_eq(&w.parker, &parker)) {
                        queue.remove(pos);
                        return WaitOutcome::TimedOut;
                    }
                    // A waker already dequeued us; take the wake it spent.
                    drop(queue);
                    woken = parker.woken.lock();
                    while !*woken {
                        parker.cv.wait(&mut woken);
                    }
                    return WaitOutcome::Woken;
                }
            }
        }
    }

    fn wake(word: &AtomicU32, count: u32, _shared: bool) -> usize {
        let addr = word.as_ptr() as usize;
        let bucket = bucket_for(addr);
        let mut taken = Vec::new();
        {
            let mut queue = bucket.queue.lock();
            let mut i = 0;
            while i < queue.len() && taken.len() < count as usize {
                if queue[i].addr == addr {
                    taken.push(queue.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for waiter in &taken {
            *waiter.parker.woken.lock() = true;
            waiter.parker.cv.notify_one();
        }
        taken.len()
    }
}

/// Wait queue used when a primitive does not name one.
#[cfg(target_os = "linux")]
pub type DefaultWaitQueue = Futex;
#[cfg(not(target_os = "linux"))]
pub type DefaultWaitQueue = Emulated;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn stale_value_does_not_block<W: WaitQueue>() {
        let word = AtomicU32::new(1);
        assert_eq!(W::wait(&word, 0, None, false), WaitOutcome::ValueChanged);
    }

    fn past_deadline_times_out<W: WaitQueue>() {
        let word = AtomicU32::new(0);
        let d = Deadline::elapsed_by(ClockId::Monotonic, Duration::from_millis(50));
        assert_eq!(W::wait(&word, 0, Some(&d), false), WaitOutcome::TimedOut);
    }

    fn wake_releases_waiter<W: WaitQueue>() {
        let word = Arc::new(AtomicU32::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let (w, dn) = (Arc::clone(&word), Arc::clone(&done));
        let h = thread::spawn(move || {
            while w.load(Ordering::SeqCst) == 0 {
                W::wait(&w, 0, None, false);
            }
            dn.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::SeqCst);
        W::wake(&word, 1, false);
        h.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn emulated_contract() {
        stale_value_does_not_block::<Emulated>();
        past_deadline_times_out::<Emulated>();
        wake_releases_waiter::<Emulated>();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn futex_contract() {
        stale_value_does_not_block::<Futex>();
        past_deadline_times_out::<Futex>();
        wake_releases_waiter::<Futex>();
    }

    #[test]
    fn emulated_wake_counts_only_matching_words() {
        let a = Arc::new(AtomicU32::new(0));
        let b = AtomicU32::new(0);
        let a2 = Arc::clone(&a);
        let h = thread::spawn(move || Emulated::wait(&a2, 0, None, false));
        let addr = a.as_ptr() as usize;
        while !bucket_for(addr).queue.lock().iter().any(|w| w.addr == addr) {
            thread::yield_now();
        }
        assert_eq!(Emulated::wake(&b, WAKE_ALL, false), 0);
        assert_eq!(Emulated::wake(&a, WAKE_ALL, false), 1);
        assert_eq!(h.join().unwrap(), WaitOutcome::Woken);
    }
}
