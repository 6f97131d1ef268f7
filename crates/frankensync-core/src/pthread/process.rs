//! Process-scoped synchronization state.
//!
//! One [`Process`] value carries everything the primitives need to know about
//! the process as a whole: the fork generation consumed by once controls,
//! the live thread count, and the tid registry used to reach a lock owner's
//! [`ThreadState`] for priority inheritance. [`global`] is the instance every
//! primitive uses by default; tests build isolated ones with [`Process::new`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::thread::ThreadState;

/// Fork generations advance in steps of 4; the once word keeps its two
/// state bits below the generation.
pub const FORK_GENERATION_STEP: u32 = 4;

pub struct Process {
    fork_generation: AtomicU32,
    nthreads: AtomicUsize,
    threads: Mutex<BTreeMap<u32, Weak<ThreadState>>>,
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

impl Process {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fork_generation: AtomicU32::new(0),
            nthreads: AtomicUsize::new(0),
            threads: parking_lot::const_mutex(BTreeMap::new()),
        }
    }

    /// Current fork generation (always a multiple of 4).
    pub fn fork_generation(&self) -> u32 {
        self.fork_generation.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.nthreads.load(Ordering::Relaxed)
    }

    pub(crate) fn register(&self, state: &Arc<ThreadState>) {
        self.threads
            .lock()
            .insert(state.tid(), Arc::downgrade(state));
        self.nthreads.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop `state` from the registry. A recycled tid already claimed by a
    /// newer thread is left alone.
    pub(crate) fn unregister(&self, state: &ThreadState) {
        let mut threads = self.threads.lock();
        let ours = threads
            .get(&state.tid())
            .is_some_and(|w| core::ptr::eq(w.as_ptr(), state));
        if ours {
            threads.remove(&state.tid());
            self.nthreads.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Thread state for `tid`, if that thread is still alive in this process.
    pub fn lookup(&self, tid: u32) -> Option<Arc<ThreadState>> {
        self.threads.lock().get(&tid).and_then(Weak::upgrade)
    }

    /// Fork handler for the child side: advance the generation and forget
    /// every thread except the caller, which is the only one that survives.
    pub fn after_fork_child(&self, survivor: u32) {
        self.fork_generation
            .fetch_add(FORK_GENERATION_STEP, Ordering::AcqRel);
        let mut threads = self.threads.lock();
        threads.retain(|tid, _| *tid == survivor);
        self.nthreads.store(threads.len().max(1), Ordering::Relaxed);
    }
}

static GLOBAL: Process = Process::new();

/// The process-wide context.
pub fn global() -> &'static Process {
    &GLOBAL
}
