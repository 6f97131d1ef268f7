//! POSIX threads synchronization.
//!
//! Mutexes, reader-writer locks, condition variables and once controls over
//! a [`WaitQueue`], plus the per-thread and per-process state they consult.

pub mod cancel;
pub mod cond;
#[allow(unsafe_code)]
pub mod mutex;
pub mod once;
pub mod process;
pub mod rwlock;
#[allow(unsafe_code)]
pub mod thread;
#[allow(unsafe_code)]
pub mod waitq;

pub use cancel::{
    CancelState, CancelType, CleanupGuard, ThreadCanceled, catch_cancel, cleanup_push,
    is_cancellation, set_cancel_state, set_cancel_type, testcancel,
};
pub use cond::{
    CondConfig, CondvarData, PTHREAD_COND_CLOCK_MONOTONIC, PTHREAD_COND_CLOCK_REALTIME,
};
pub use mutex::{
    LockOutcome, MutexConfig, MutexData, MutexKind, MutexState, PTHREAD_MUTEX_ADAPTIVE_NP,
    PTHREAD_MUTEX_ERRORCHECK, PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_RECURSIVE, Protocol,
};
pub use once::{OnceControl, OnceState};
pub use process::Process;
pub use rwlock::{
    PTHREAD_RWLOCK_DEFAULT_NP, PTHREAD_RWLOCK_PREFER_READER_NP,
    PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP, PTHREAD_RWLOCK_PREFER_WRITER_NP, RwLockConfig,
    RwLockData, RwLockPreference, RwLockState,
};
pub use thread::{ThreadState, current, current_tid};
pub use waitq::{DefaultWaitQueue, Emulated, WaitOutcome, WaitQueue};
#[cfg(target_os = "linux")]
pub use waitq::Futex;
