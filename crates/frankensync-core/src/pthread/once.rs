//! One-time initialization.
//!
//! The control word holds two state bits below a fork-generation stamp:
//!
//! ```text
//! [ fork generation (multiple of 4) ][ DONE ][ INPROGRESS ]
//! ```
//!
//! An in-progress mark is only honored while its stamp matches the current
//! generation of the process. After a fork the child sees a stale stamp and
//! runs the initializer again itself.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use super::process::{self, Process};
use super::thread;
use super::waitq::{DefaultWaitQueue, WAKE_ALL, WaitQueue};
use crate::trace::{self, SyncFamily};

pub const ONCE_INPROGRESS: u32 = 1;
pub const ONCE_DONE: u32 = 2;
const ONCE_STATE_MASK: u32 = ONCE_INPROGRESS | ONCE_DONE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum OnceState {
    NotStarted,
    InProgress,
    Done,
}

#[repr(C)]
pub struct OnceControl<W: WaitQueue = DefaultWaitQueue> {
    word: AtomicU32,
    _wait: PhantomData<fn() -> W>,
}

impl<W: WaitQueue> Default for OnceControl<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: WaitQueue> core::fmt::Debug for OnceControl<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OnceControl")
            .field("word", &self.word.load(Ordering::Relaxed))
            .finish()
    }
}

/// Re-arms the control if the initializer does not return normally.
struct Rearm<'a> {
    word: &'a AtomicU32,
    armed: bool,
}

impl Drop for Rearm<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.word.store(0, Ordering::Release);
            let addr = self.word.as_ptr() as usize;
            trace::record(SyncFamily::Once, "call_once", addr, "rearmed");
        }
    }
}

impl<W: WaitQueue> OnceControl<W> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            _wait: PhantomData,
        }
    }

    /// State as seen by the global process.
    pub fn state(&self) -> OnceState {
        self.state_in(process::global())
    }

    pub fn state_in(&self, process: &Process) -> OnceState {
        let v = self.word.load(Ordering::Acquire);
        if v & ONCE_DONE != 0 {
            OnceState::Done
        } else if v & ONCE_INPROGRESS != 0 && v & !ONCE_STATE_MASK == process.fork_generation() {
            OnceState::InProgress
        } else {
            OnceState::NotStarted
        }
    }

    /// Run `init` unless it already completed. Concurrent callers wait for
    /// the running initializer.
    pub fn call_once<F: FnOnce()>(&self, init: F) {
        self.call_once_in(process::global(), init);
    }

    pub fn call_once_in<F: FnOnce()>(&self, process: &Process, init: F) {
        if self.word.load(Ordering::Acquire) & ONCE_DONE != 0 {
            return;
        }
        self.call_once_slow(process, init);
    }

    #[cold]
    fn call_once_slow<F: FnOnce()>(&self, process: &Process, init: F) {
        loop {
            let v = self.word.load(Ordering::Acquire);
            if v & ONCE_DONE != 0 {
                return;
            }
            let generation = process.fork_generation();
            if v & ONCE_INPROGRESS != 0 && v & !ONCE_STATE_MASK == generation {
                // Not a cancellation point: the initializer may still finish.
                thread::park::<W>(&self.word, v, None, false, false);
                continue;
            }
            let claimed = generation | ONCE_INPROGRESS;
            if self
                .word
                .compare_exchange(v, claimed, Ordering::Acquire, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if v & ONCE_INPROGRESS != 0 {
                trace::record(
                    SyncFamily::Once,
                    "call_once",
                    self.word.as_ptr() as usize,
                    "rearm_after_fork",
                );
            }

            // Dropped last: waiters wake after the word is final or reset.
            let _wake = WakeAll::<W>(&self.word, PhantomData);
            let mut rearm = Rearm {
                word: &self.word,
                armed: true,
            };
            init();
            rearm.armed = false;
            self.word.store(ONCE_DONE, Ordering::Release);
            return;
        }
    }
}

struct WakeAll<'a, W: WaitQueue>(&'a AtomicU32, PhantomData<fn() -> W>);

impl<W: WaitQueue> Drop for WakeAll<'_, W> {
    fn drop(&mut self) {
        W::wake(self.0, WAKE_ALL, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pthread::waitq::Emulated;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    type TestOnce = OnceControl<Emulated>;

    #[test]
    fn runs_once_and_reports_done() {
        let once = TestOnce::new();
        let hits = AtomicUsize::new(0);
        assert_eq!(once.state(), OnceState::NotStarted);
        once.call_once(|| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        once.call_once(|| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(once.state(), OnceState::Done);
    }

    #[test]
    fn panicking_initializer_rearms() {
        let once = TestOnce::new();
        let r = std::panic::catch_unwind(|| once.call_once(|| panic!("init failed")));
        assert!(r.is_err());
        assert_eq!(once.state(), OnceState::NotStarted);
        let mut ran = false;
        once.call_once(|| ran = true);
        assert!(ran);
        assert_eq!(once.state(), OnceState::Done);
    }

    #[test]
    fn waiters_block_until_done() {
        let once = Arc::new(TestOnce::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let once = Arc::clone(&once);
                let hits = Arc::clone(&hits);
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    gate.wait();
                    once.call_once(|| {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                    // Whoever returns must see the initializer's effect.
                    assert_eq!(hits.load(Ordering::SeqCst), 1);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn fork_in_progress_reruns_in_child() {
        let process = Process::new();
        let once = TestOnce::new();
        let started = Barrier::new(2);
        let release = Barrier::new(2);
        let parent_runs = AtomicUsize::new(0);
        let child_runs = AtomicUsize::new(0);
        std::thread::scope(|s| {
            s.spawn(|| {
                once.call_once_in(&process, || {
                    parent_runs.fetch_add(1, Ordering::SeqCst);
                    started.wait();
                    release.wait();
                });
            });
            started.wait();
            assert_eq!(once.state_in(&process), OnceState::InProgress);
            process.after_fork_child(thread::current_tid());
            assert_eq!(once.state_in(&process), OnceState::NotStarted);
            once.call_once_in(&process, || {
                child_runs.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(once.state_in(&process), OnceState::Done);
            release.wait();
        });
        assert_eq!(parent_runs.load(Ordering::SeqCst), 1);
        assert_eq!(child_runs.load(Ordering::SeqCst), 1);
    }
}
