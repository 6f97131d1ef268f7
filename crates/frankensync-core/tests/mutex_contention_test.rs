#![cfg(target_os = "linux")]

//! Mutex exclusion and timeout behavior on the kernel futex path.

use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use frankensync_core::pthread::Emulated;
use frankensync_core::trace;
use frankensync_core::{ClockId, LockOutcome, MutexConfig, MutexData, MutexKind, SyncError};

const THREADS: usize = 8;
const ITERS: u64 = 10_000;

fn hammer(m: &MutexData, recursive: bool) {
    let counter = AtomicU64::new(0);
    let inside = AtomicBool::new(false);
    let start = Barrier::new(THREADS);
    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                start.wait();
                for _ in 0..ITERS {
                    assert_eq!(m.lock(), Ok(LockOutcome::Acquired));
                    if recursive {
                        assert_eq!(m.lock(), Ok(LockOutcome::Acquired));
                    }
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders");
                    // Non-atomic read-modify-write under the lock.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    inside.store(false, Ordering::SeqCst);
                    if recursive {
                        m.unlock().unwrap();
                    }
                    m.unlock().unwrap();
                }
            });
        }
    });
    assert_eq!(counter.load(Ordering::SeqCst), THREADS as u64 * ITERS);
    assert_eq!(m.state().owner_tid, 0);
    assert!(!m.state().waiters);
}

#[test]
fn normal_mutex_excludes() {
    hammer(&MutexData::default(), false);
}

#[test]
fn adaptive_mutex_excludes() {
    hammer(&MutexData::new(MutexConfig::new(MutexKind::Adaptive)).unwrap(), false);
}

#[test]
fn recursive_mutex_excludes() {
    hammer(&MutexData::new(MutexConfig::new(MutexKind::Recursive)).unwrap(), true);
}

#[test]
fn errorcheck_mutex_excludes() {
    hammer(&MutexData::new(MutexConfig::new(MutexKind::ErrorCheck)).unwrap(), false);
}

#[test]
fn timedlock_with_past_deadline_fails_without_blocking() {
    let m: MutexData = MutexData::default();
    let addr = &m as *const MutexData as usize;
    let held = Barrier::new(2);
    let done = Barrier::new(2);
    std::thread::scope(|s| {
        s.spawn(|| {
            m.lock().unwrap();
            held.wait();
            done.wait();
            m.unlock().unwrap();
        });
        held.wait();
        let past = ClockId::Realtime.now().saturating_sub(Duration::from_secs(5));
        let t0 = Instant::now();
        assert_eq!(m.timedlock(past), Err(SyncError::TimedOut));
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert_eq!(m.trylock(), Err(SyncError::Busy));
        done.wait();
    });
    assert!(
        trace::events_for(addr)
            .iter()
            .any(|e| e.op == "lock" && e.outcome == "timed_out")
    );
    assert_eq!(m.lock(), Ok(LockOutcome::Acquired));
    m.unlock().unwrap();
}

#[test]
fn clocklock_monotonic_times_out_after_deadline() {
    let m: MutexData = MutexData::default();
    let held = Barrier::new(2);
    let done = Barrier::new(2);
    std::thread::scope(|s| {
        s.spawn(|| {
            m.lock().unwrap();
            held.wait();
            done.wait();
            m.unlock().unwrap();
        });
        held.wait();
        let t0 = Instant::now();
        let abstime = ClockId::Monotonic.now().saturating_add(Duration::from_millis(50));
        assert_eq!(m.clocklock(ClockId::Monotonic, abstime), Err(SyncError::TimedOut));
        assert!(t0.elapsed() >= Duration::from_millis(40));
        done.wait();
    });
}

#[test]
fn emulated_queue_gives_the_same_exclusion() {
    let m: MutexData<Emulated> = MutexData::default();
    let counter = AtomicU64::new(0);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..2_000 {
                    m.lock().unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    m.unlock().unwrap();
                }
            });
        }
    });
    assert_eq!(counter.load(Ordering::SeqCst), 8_000);
}
