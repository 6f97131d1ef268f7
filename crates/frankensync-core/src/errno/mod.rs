//! Error numbers and error kinds for the synchronization core.
//!
//! Operations return [`SyncError`]; the C surface speaks errno, so every
//! kind maps onto exactly one `<errno.h>` value and back.

use core::fmt;

/// Well-known errno constants emitted by the sync core.
pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EAGAIN: i32 = 11;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const ETIMEDOUT: i32 = 110;
pub const EOWNERDEAD: i32 = 130;
pub const ENOTRECOVERABLE: i32 = 131;

/// Returns the error message string for the given errno value.
pub fn strerror_message(errnum: i32) -> &'static str {
    match errnum {
        0 => "Success",
        EPERM => "Operation not permitted",
        ESRCH => "No such process",
        EINTR => "Interrupted system call",
        EAGAIN => "Resource temporarily unavailable",
        EBUSY => "Device or resource busy",
        EINVAL => "Invalid argument",
        EDEADLK => "Resource deadlock avoided",
        ENOSYS => "Function not implemented",
        ETIMEDOUT => "Connection timed out",
        EOWNERDEAD => "Owner died",
        ENOTRECOVERABLE => "State not recoverable",
        _ => "Unknown error",
    }
}

/// Error kinds reported by mutex, rwlock, condvar and once operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum SyncError {
    /// A try-variant met contention.
    Busy,
    /// The absolute deadline passed before the operation could complete.
    TimedOut,
    /// The caller already holds the lock and the kind detects self-relock.
    Deadlock,
    /// Release or consistency call by a thread that does not hold the lock.
    NotOwner,
    /// The lock is held, but its previous owner died inside the critical section.
    Inconsistent,
    /// A robust mutex was released while inconsistent; it is permanently unusable.
    NotRecoverable,
    /// Misuse: bad clock, bad timespec, bad ceiling, mismatched condvar mutex,
    /// or an operation on a destroyed object.
    InvalidArgument,
    /// A read holder asked for the write lock of the same rwlock.
    WouldDeadlock,
    /// The caller's priority exceeds the mutex priority ceiling.
    ProtocolViolation,
    /// The recursion counter of a recursive mutex is exhausted.
    Again,
}

impl SyncError {
    /// The POSIX errno equivalent of this kind.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::Busy => EBUSY,
            Self::TimedOut => ETIMEDOUT,
            Self::Deadlock | Self::WouldDeadlock => EDEADLK,
            Self::NotOwner => EPERM,
            Self::Inconsistent => EOWNERDEAD,
            Self::NotRecoverable => ENOTRECOVERABLE,
            Self::InvalidArgument | Self::ProtocolViolation => EINVAL,
            Self::Again => EAGAIN,
        }
    }

    /// Inverse of [`SyncError::errno`]. `EDEADLK` and `EINVAL` are ambiguous and
    /// resolve to the more common kind (`Deadlock`, `InvalidArgument`).
    #[must_use]
    pub const fn from_errno(errnum: i32) -> Option<Self> {
        match errnum {
            EBUSY => Some(Self::Busy),
            ETIMEDOUT => Some(Self::TimedOut),
            EDEADLK => Some(Self::Deadlock),
            EPERM => Some(Self::NotOwner),
            EOWNERDEAD => Some(Self::Inconsistent),
            ENOTRECOVERABLE => Some(Self::NotRecoverable),
            EINVAL => Some(Self::InvalidArgument),
            EAGAIN => Some(Self::Again),
            _ => None,
        }
    }

    /// Stable lowercase name, used in trace output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::TimedOut => "timed_out",
            Self::Deadlock => "deadlock",
            Self::NotOwner => "not_owner",
            Self::Inconsistent => "inconsistent",
            Self::NotRecoverable => "not_recoverable",
            Self::InvalidArgument => "invalid_argument",
            Self::WouldDeadlock => "would_deadlock",
            Self::ProtocolViolation => "protocol_violation",
            Self::Again => "again",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(strerror_message(self.errno()))
    }
}

impl std::error::Error for SyncError {}
