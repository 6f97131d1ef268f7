//! Thin wrappers over the kernel calls the sync core needs.
//!
//! Only two facilities are used: `futex(2)` for blocking on a 32-bit word and
//! `clock_gettime(2)` for deadlines. Errors come back as raw errno values so
//! callers can match on `EAGAIN`/`EINTR`/`ETIMEDOUT` directly.

use crate::errno;
use crate::time::Timespec;

pub const FUTEX_WAIT: i32 = 0;
pub const FUTEX_WAKE: i32 = 1;
pub const FUTEX_WAIT_BITSET: i32 = 9;
pub const FUTEX_PRIVATE_FLAG: i32 = 0x80;
pub const FUTEX_CLOCK_REALTIME: i32 = 256;
pub const FUTEX_BITSET_MATCH_ANY: u32 = 0xFFFF_FFFF;

fn last_host_errno(default_errno: i32) -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(default_errno)
}

/// Raw `futex(2)`.
///
/// # Safety
///
/// `uaddr` must point to a live, 4-byte aligned word for the duration of the
/// call. `timeout`, when non-null, must point to a valid kernel timespec.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub unsafe fn sys_futex(
    uaddr: *const u32,
    op: i32,
    val: u32,
    timeout: *const libc::timespec,
    uaddr2: *const u32,
    val3: u32,
) -> Result<isize, i32> {
    // SAFETY: caller upholds the pointer contract above.
    let ret = unsafe { libc::syscall(libc::SYS_futex, uaddr, op, val, timeout, uaddr2, val3) };
    if ret < 0 {
        Err(last_host_errno(errno::ENOSYS))
    } else {
        Ok(ret as isize)
    }
}

/// Block while `*uaddr == expected`, optionally until the absolute `abstime`
/// on the selected clock.
///
/// # Safety
///
/// `uaddr` must point to a live, 4-byte aligned word.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub unsafe fn futex_wait_abs(
    uaddr: *const u32,
    expected: u32,
    abstime: Option<(Timespec, bool)>,
    shared: bool,
) -> Result<(), i32> {
    let private = if shared { 0 } else { FUTEX_PRIVATE_FLAG };
    let result = match abstime {
        None => {
            // SAFETY: forwarded pointer contract.
            unsafe {
                sys_futex(
                    uaddr,
                    FUTEX_WAIT | private,
                    expected,
                    core::ptr::null(),
                    core::ptr::null(),
                    0,
                )
            }
        }
        Some((ts, realtime)) => {
            let kts = libc::timespec {
                tv_sec: ts.tv_sec as libc::time_t,
                tv_nsec: ts.tv_nsec as libc::c_long,
            };
            let clock = if realtime { FUTEX_CLOCK_REALTIME } else { 0 };
            // SAFETY: `kts` lives across the call; forwarded pointer contract.
            unsafe {
                sys_futex(
                    uaddr,
                    FUTEX_WAIT_BITSET | private | clock,
                    expected,
                    &kts,
                    core::ptr::null(),
                    FUTEX_BITSET_MATCH_ANY,
                )
            }
        }
    };
    result.map(|_| ())
}

/// Wake up to `count` waiters blocked on `uaddr`. Returns how many woke.
///
/// # Safety
///
/// `uaddr` must point to a live, 4-byte aligned word.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub unsafe fn futex_wake(uaddr: *const u32, count: u32, shared: bool) -> usize {
    let private = if shared { 0 } else { FUTEX_PRIVATE_FLAG };
    let count = count.min(i32::MAX as u32);
    // SAFETY: forwarded pointer contract.
    match unsafe {
        sys_futex(
            uaddr,
            FUTEX_WAKE | private,
            count,
            core::ptr::null(),
            core::ptr::null(),
            0,
        )
    } {
        Ok(n) => n.max(0) as usize,
        Err(_) => 0,
    }
}

/// Read `clock_id`. A failing clock reads as the epoch, which makes any
/// deadline on it look expired rather than infinite.
#[allow(unsafe_code)]
pub fn clock_now(clock_id: i32) -> Timespec {
    let raw = match clock_id {
        crate::time::CLOCK_MONOTONIC => libc::CLOCK_MONOTONIC,
        _ => libc::CLOCK_REALTIME,
    };
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(raw, &mut ts) };
    if rc != 0 {
        return Timespec::default();
    }
    Timespec::new(ts.tv_sec as i64, ts.tv_nsec as i64)
}

/// Kernel thread id of the caller.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn gettid() -> i32 {
    // SAFETY: gettid has no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}
