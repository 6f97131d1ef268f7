//! Futex-backed POSIX synchronization core.
//!
//! Mutexes (normal, recursive, error-checking, adaptive, robust,
//! priority-inherit and priority-protect), phase-fair reader-writer locks,
//! condition variables and once controls, all built on a pluggable
//! [`pthread::WaitQueue`]. Cancellation is delivered at blocking points as a
//! Rust unwind (see [`pthread::cancel`]).

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod pthread;
#[allow(unsafe_code)]
pub mod syscall;
pub mod time;
pub mod trace;

pub use errno::SyncError;
pub use pthread::{
    CondConfig, CondvarData, LockOutcome, MutexConfig, MutexData, MutexKind, OnceControl,
    Protocol, RwLockConfig, RwLockData, RwLockPreference,
};
pub use time::{ClockId, Deadline, Timespec};
