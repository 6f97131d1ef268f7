#![cfg(target_os = "linux")]

//! Condition-variable hand-offs on the kernel futex path.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use frankensync_core::pthread::Emulated;
use frankensync_core::{ClockId, CondConfig, CondvarData, MutexData, SyncError};

const ROUNDS: u64 = 10_000;

/// Ping-pong: each side waits for the other's write, observing it on return.
fn ping_pong<W: frankensync_core::pthread::WaitQueue>() {
    let m: MutexData<W> = MutexData::default();
    let cv: CondvarData<W> = CondvarData::default();
    // Written only under `m`.
    let value = AtomicU64::new(0);

    std::thread::scope(|s| {
        s.spawn(|| {
            for round in 0..ROUNDS {
                m.lock().unwrap();
                while value.load(Ordering::Relaxed) != 2 * round + 1 {
                    cv.wait(&m).unwrap();
                }
                value.store(2 * round + 2, Ordering::Relaxed);
                cv.signal().unwrap();
                m.unlock().unwrap();
            }
        });

        for round in 0..ROUNDS {
            m.lock().unwrap();
            while value.load(Ordering::Relaxed) != 2 * round {
                cv.wait(&m).unwrap();
            }
            value.store(2 * round + 1, Ordering::Relaxed);
            cv.signal().unwrap();
            m.unlock().unwrap();
        }
    });
    assert_eq!(value.load(Ordering::SeqCst), 2 * ROUNDS);
    assert!(!cv.has_waiters());
}

#[test]
fn ten_thousand_round_trips_without_a_lost_wakeup() {
    ping_pong::<frankensync_core::pthread::Futex>();
}

#[test]
fn emulated_queue_round_trips() {
    ping_pong::<Emulated>();
}

#[test]
fn broadcast_releases_every_waiter() {
    let m: MutexData = MutexData::default();
    let cv: CondvarData = CondvarData::default();
    let go = AtomicU64::new(0);
    let woke = AtomicUsize::new(0);
    let entered = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                m.lock().unwrap();
                entered.fetch_add(1, Ordering::SeqCst);
                while go.load(Ordering::Relaxed) == 0 {
                    cv.wait(&m).unwrap();
                }
                woke.fetch_add(1, Ordering::SeqCst);
                m.unlock().unwrap();
            });
        }
        while entered.load(Ordering::SeqCst) < 8 {
            std::thread::yield_now();
        }
        m.lock().unwrap();
        go.store(1, Ordering::Relaxed);
        cv.broadcast().unwrap();
        m.unlock().unwrap();
    });
    assert_eq!(woke.load(Ordering::SeqCst), 8);
    cv.destroy().unwrap();
}

#[test]
fn monotonic_timedwait_times_out_and_keeps_the_mutex() {
    let m: MutexData = MutexData::default();
    let cv: CondvarData = CondvarData::new(CondConfig {
        clock: ClockId::Monotonic,
        pshared: false,
    });
    m.lock().unwrap();
    let t0 = Instant::now();
    let abstime = ClockId::Monotonic.now().saturating_add(Duration::from_millis(50));
    assert_eq!(cv.timedwait(&m, abstime), Err(SyncError::TimedOut));
    assert!(t0.elapsed() >= Duration::from_millis(40));
    assert!(m.is_held_by_current());
    m.unlock().unwrap();
}

#[test]
fn shared_condvar_and_mutex_use_the_shared_futex_keys() {
    use frankensync_core::{MutexConfig, MutexKind};
    let m: MutexData =
        MutexData::new(MutexConfig::new(MutexKind::Normal).pshared(true)).unwrap();
    let cv: CondvarData = CondvarData::new(CondConfig {
        clock: ClockId::Realtime,
        pshared: true,
    });
    let flag = AtomicU64::new(0);
    std::thread::scope(|s| {
        s.spawn(|| {
            m.lock().unwrap();
            while flag.load(Ordering::Relaxed) == 0 {
                cv.wait(&m).unwrap();
            }
            m.unlock().unwrap();
        });
        while !cv.has_waiters() {
            std::thread::yield_now();
        }
        m.lock().unwrap();
        flag.store(1, Ordering::Relaxed);
        cv.signal().unwrap();
        m.unlock().unwrap();
    });
}
