//! Clocks, timespecs and absolute deadlines.
//!
//! Timed operations take an absolute deadline measured against a selected
//! clock. This module validates the deadline and converts it into whatever
//! the wait queue needs: a kernel timespec for the futex path, a relative
//! `Duration` for the emulated path.

use core::time::Duration;

use crate::errno::SyncError;
use crate::syscall;

/// Represents a timespec value (seconds + nanoseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    /// Seconds.
    pub tv_sec: i64,
    /// Nanoseconds (0 to 999_999_999).
    pub tv_nsec: i64,
}

/// Clock identifiers for `clock_gettime`.
pub const CLOCK_REALTIME: i32 = 0;
pub const CLOCK_MONOTONIC: i32 = 1;

const NANOS_PER_SEC: i64 = 1_000_000_000;

impl Timespec {
    #[must_use]
    pub const fn new(tv_sec: i64, tv_nsec: i64) -> Self {
        Self { tv_sec, tv_nsec }
    }

    /// `self + d`, saturating at `i64::MAX` seconds.
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        let mut tv_sec = self.tv_sec.saturating_add(secs);
        let mut tv_nsec = self.tv_nsec + i64::from(d.subsec_nanos());
        if tv_nsec >= NANOS_PER_SEC {
            tv_nsec -= NANOS_PER_SEC;
            tv_sec = tv_sec.saturating_add(1);
        }
        Self { tv_sec, tv_nsec }
    }

    /// `self - d`, saturating at `i64::MIN` seconds.
    #[must_use]
    pub fn saturating_sub(self, d: Duration) -> Self {
        let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
        let mut tv_sec = self.tv_sec.saturating_sub(secs);
        let mut tv_nsec = self.tv_nsec - i64::from(d.subsec_nanos());
        if tv_nsec < 0 {
            tv_nsec += NANOS_PER_SEC;
            tv_sec = tv_sec.saturating_sub(1);
        }
        Self { tv_sec, tv_nsec }
    }

    /// Time from `earlier` to `self`, or `None` when `self <= earlier`.
    #[must_use]
    pub fn checked_duration_since(self, earlier: Self) -> Option<Duration> {
        if self <= earlier {
            return None;
        }
        let mut secs = self.tv_sec - earlier.tv_sec;
        let mut nsec = self.tv_nsec - earlier.tv_nsec;
        if nsec < 0 {
            nsec += NANOS_PER_SEC;
            secs -= 1;
        }
        Some(Duration::new(secs as u64, nsec as u32))
    }
}

/// Validate a timespec for timed waits: tv_nsec must be in [0, 999_999_999].
#[must_use]
pub const fn valid_timespec_nsec(tv_nsec: i64) -> bool {
    tv_nsec >= 0 && tv_nsec < NANOS_PER_SEC
}

/// Clock a deadline is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ClockId {
    #[default]
    Realtime,
    Monotonic,
}

impl ClockId {
    /// Map a raw `clockid_t`; only the two clocks the wait queue supports are accepted.
    pub const fn from_raw(clock_id: i32) -> Result<Self, SyncError> {
        match clock_id {
            CLOCK_REALTIME => Ok(Self::Realtime),
            CLOCK_MONOTONIC => Ok(Self::Monotonic),
            _ => Err(SyncError::InvalidArgument),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Realtime => CLOCK_REALTIME,
            Self::Monotonic => CLOCK_MONOTONIC,
        }
    }

    /// Current time on this clock.
    #[must_use]
    pub fn now(self) -> Timespec {
        syscall::clock_now(self.as_raw())
    }
}

/// An absolute point in time on a specific clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Deadline {
    pub clock: ClockId,
    pub abstime: Timespec,
}

impl Deadline {
    /// Build a deadline, rejecting malformed timespecs.
    pub const fn new(clock: ClockId, abstime: Timespec) -> Result<Self, SyncError> {
        if !valid_timespec_nsec(abstime.tv_nsec) {
            return Err(SyncError::InvalidArgument);
        }
        Ok(Self { clock, abstime })
    }

    /// Build a deadline from a raw clock id.
    pub fn from_raw(clock_id: i32, tv_sec: i64, tv_nsec: i64) -> Result<Self, SyncError> {
        Self::new(ClockId::from_raw(clock_id)?, Timespec::new(tv_sec, tv_nsec))
    }

    /// A deadline `d` from now on `clock`.
    #[must_use]
    pub fn after(clock: ClockId, d: Duration) -> Self {
        Self {
            clock,
            abstime: clock.now().saturating_add(d),
        }
    }

    /// A deadline that already passed `d` ago.
    #[must_use]
    pub fn elapsed_by(clock: ClockId, d: Duration) -> Self {
        Self {
            clock,
            abstime: clock.now().saturating_sub(d),
        }
    }

    /// Time left, or `None` once the deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.abstime.checked_duration_since(self.clock.now())
    }

    #[must_use]
    pub fn has_passed(&self) -> bool {
        self.remaining().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_constants() {
        assert_eq!(CLOCK_REALTIME, 0);
        assert_eq!(CLOCK_MONOTONIC, 1);
        assert_eq!(ClockId::from_raw(1), Ok(ClockId::Monotonic));
        assert_eq!(ClockId::from_raw(2), Err(SyncError::InvalidArgument));
        assert_eq!(ClockId::from_raw(-1), Err(SyncError::InvalidArgument));
    }

    #[test]
    fn timespec_nsec_valid_range() {
        assert!(valid_timespec_nsec(0));
        assert!(valid_timespec_nsec(999_999_999));
        assert!(!valid_timespec_nsec(-1));
        assert!(!valid_timespec_nsec(1_000_000_000));
    }

    #[test]
    fn deadline_rejects_bad_nsec() {
        assert_eq!(
            Deadline::from_raw(CLOCK_REALTIME, 10, 1_000_000_000),
            Err(SyncError::InvalidArgument)
        );
        assert_eq!(
            Deadline::from_raw(7, 10, 0),
            Err(SyncError::InvalidArgument)
        );
    }

    #[test]
    fn timespec_arithmetic_carries_nanoseconds() {
        let t = Timespec::new(5, 900_000_000);
        assert_eq!(
            t.saturating_add(Duration::from_millis(200)),
            Timespec::new(6, 100_000_000)
        );
        assert_eq!(
            t.saturating_sub(Duration::from_millis(950)),
            Timespec::new(4, 950_000_000)
        );
        assert_eq!(
            Timespec::new(6, 100_000_000).checked_duration_since(t),
            Some(Duration::from_millis(200))
        );
        assert_eq!(t.checked_duration_since(t), None);
    }

    #[test]
    fn past_deadline_has_no_remaining_time() {
        for clock in [ClockId::Realtime, ClockId::Monotonic] {
            let past = Deadline::elapsed_by(clock, Duration::from_millis(50));
            assert!(past.has_passed());
            let future = Deadline::after(clock, Duration::from_secs(60));
            assert!(future.remaining().is_some());
        }
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = ClockId::Monotonic.now();
        let b = ClockId::Monotonic.now();
        assert!(b >= a);
    }
}
