#![cfg(target_os = "linux")]

//! Phase-fair writer admission, reader overflow, and reader preference.

use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use frankensync_core::trace;
use frankensync_core::{RwLockConfig, RwLockData, RwLockPreference, SyncError};

const LATE_READERS: usize = 1_000;

#[test]
fn readers_arriving_after_a_waiting_writer_go_after_it() {
    let lock: RwLockData = RwLockData::default();
    let clock = AtomicU64::new(0);
    let writer_at = AtomicU64::new(u64::MAX);
    let reader_at: Vec<AtomicU64> = (0..LATE_READERS).map(|_| AtomicU64::new(0)).collect();

    lock.rdlock().unwrap();
    std::thread::scope(|s| {
        s.spawn(|| {
            lock.wrlock().unwrap();
            writer_at.store(clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            lock.unlock().unwrap();
        });
        while !lock.state().writer_waiting {
            std::thread::yield_now();
        }

        let (lock, clock) = (&lock, &clock);
        for slot in &reader_at {
            std::thread::Builder::new()
                .stack_size(128 * 1024)
                .spawn_scoped(s, move || {
                    lock.rdlock().unwrap();
                    slot.store(clock.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
                    lock.unlock().unwrap();
                })
                .unwrap();
        }
        // None of them can get in while the phase belongs to the writer.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.load(Ordering::SeqCst), 0);
        assert_eq!(lock.state().readers, 1);
        lock.unlock().unwrap();
    });

    let w = writer_at.load(Ordering::SeqCst);
    assert_eq!(w, 0);
    assert!(reader_at.iter().all(|r| r.load(Ordering::SeqCst) > w));
    assert_eq!(clock.load(Ordering::SeqCst), LATE_READERS as u64 + 1);
    let st = lock.state();
    assert_eq!((st.readers, st.write_phase, st.queued_readers), (0, false, 0));
}

#[test]
fn reader_over_the_limit_queues_until_one_leaves() {
    let lock: RwLockData = RwLockData::new(RwLockConfig {
        max_readers: 4,
        ..RwLockConfig::default()
    })
    .unwrap();
    let addr = &lock as *const RwLockData as usize;
    let holding = Barrier::new(5);
    let release = Barrier::new(5);
    let late_in = AtomicBool::new(false);

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                lock.rdlock().unwrap();
                holding.wait();
                release.wait();
                lock.unlock().unwrap();
            });
        }
        holding.wait();
        assert_eq!(lock.state().readers, 4);
        s.spawn(|| {
            lock.rdlock().unwrap();
            late_in.store(true, Ordering::SeqCst);
            lock.unlock().unwrap();
        });
        while !(lock.state().overflow && lock.state().queued_readers == 1) {
            std::thread::yield_now();
        }
        assert!(!late_in.load(Ordering::SeqCst));
        assert_eq!(lock.state().readers, 4);
        release.wait();
    });

    assert!(late_in.load(Ordering::SeqCst));
    assert!(
        trace::events_for(addr)
            .iter()
            .any(|e| e.op == "rdlock" && e.outcome == "overflow")
    );
    assert_eq!(lock.state().readers, 0);
}

#[test]
fn writers_hand_over_and_exclude_each_other() {
    let lock: RwLockData = RwLockData::default();
    let counter = AtomicU64::new(0);
    let readers_seen = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..2_000 {
                    lock.wrlock().unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.unlock().unwrap();
                }
            });
        }
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..2_000 {
                    lock.rdlock().unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    assert!(v <= 8_000);
                    readers_seen.fetch_add(1, Ordering::Relaxed);
                    lock.unlock().unwrap();
                }
            });
        }
    });
    assert_eq!(counter.load(Ordering::SeqCst), 8_000);
    assert_eq!(readers_seen.load(Ordering::SeqCst), 8_000);
    let st = lock.state();
    assert!(!st.write_phase && !st.handover && st.queued_writers == 0);
}

#[test]
fn reader_preference_lets_readers_pass_a_queued_writer() {
    let lock: RwLockData = RwLockData::new(RwLockConfig {
        preference: RwLockPreference::PreferReader,
        ..RwLockConfig::default()
    })
    .unwrap();
    lock.rdlock().unwrap();
    std::thread::scope(|s| {
        let writer = s.spawn(|| {
            lock.wrlock().unwrap();
            lock.unlock().unwrap();
        });
        while lock.state().queued_writers == 0 {
            std::thread::yield_now();
        }
        s.spawn(|| {
            assert_eq!(lock.tryrdlock(), Ok(()));
            lock.unlock().unwrap();
        })
        .join()
        .unwrap();
        lock.unlock().unwrap();
        writer.join().unwrap();
    });
}

#[test]
fn timed_locks_expire() {
    let lock: RwLockData = RwLockData::default();
    lock.wrlock().unwrap();
    std::thread::scope(|s| {
        s.spawn(|| {
            let soon = frankensync_core::ClockId::Monotonic
                .now()
                .saturating_add(Duration::from_millis(30));
            assert_eq!(
                lock.clockrdlock(frankensync_core::ClockId::Monotonic, soon),
                Err(SyncError::TimedOut)
            );
            assert_eq!(
                lock.clockwrlock(frankensync_core::ClockId::Monotonic, soon),
                Err(SyncError::TimedOut)
            );
        });
    });
    let st = lock.state();
    assert_eq!((st.queued_readers, st.queued_writers), (0, 0));
    lock.unlock().unwrap();
    lock.rdlock().unwrap();
    lock.unlock().unwrap();
}

#[test]
fn expiring_writers_never_strand_a_handover() {
    use frankensync_core::ClockId;

    let lock: RwLockData = RwLockData::default();
    for round in 0..40 {
        let stop = AtomicBool::new(false);
        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        lock.wrlock().unwrap();
                        lock.unlock().unwrap();
                    }
                });
            }
            for t in 0..6u64 {
                let (lock, stop) = (&lock, &stop);
                s.spawn(move || {
                    let mut i = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let nanos = 200 + ((t * 7 + i) % 15) * 200;
                        let soon = ClockId::Monotonic
                            .now()
                            .saturating_add(Duration::from_nanos(nanos));
                        match lock.clockwrlock(ClockId::Monotonic, soon) {
                            Ok(()) => lock.unlock().unwrap(),
                            Err(e) => assert_eq!(e, SyncError::TimedOut),
                        }
                        i += 1;
                    }
                });
            }
            std::thread::sleep(Duration::from_millis(5));
            stop.store(true, Ordering::Relaxed);
        });

        let st = lock.state();
        assert!(
            !st.write_phase && !st.handover && st.queued_writers == 0,
            "round {round}: {st:?}"
        );
        assert_eq!(lock.tryrdlock(), Ok(()));
        lock.unlock().unwrap();
    }
}
