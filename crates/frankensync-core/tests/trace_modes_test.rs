//! Trace-mode overrides. One test per binary: the mode is process-wide.

use std::time::Duration;

use frankensync_core::config::{self, TraceMode};
use frankensync_core::pthread::Emulated;
use frankensync_core::trace::{self, SyncFamily};
use frankensync_core::{ClockId, MutexData, SyncError};

fn time_out_once(m: &MutexData<Emulated>) {
    std::thread::scope(|s| {
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        s.spawn(move || {
            m.lock().unwrap();
            held_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            m.unlock().unwrap();
        });
        held_rx.recv().unwrap();
        let past = ClockId::Realtime.now().saturating_sub(Duration::from_secs(1));
        assert_eq!(m.timedlock(past), Err(SyncError::TimedOut));
        done_tx.send(()).unwrap();
    });
}

#[test]
fn events_follow_the_trace_mode() {
    let m: MutexData<Emulated> = MutexData::default();
    let addr = &m as *const MutexData<Emulated> as usize;

    config::set_trace_mode(TraceMode::Stderr);
    time_out_once(&m);
    let events = trace::events_for(addr);
    let ev = events
        .iter()
        .find(|e| e.outcome == "timed_out")
        .expect("timeout recorded");
    assert_eq!(ev.family, SyncFamily::Mutex);
    assert_ne!(ev.tid, 0);
    let json: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
    assert_eq!(json["family"], "mutex");
    assert_eq!(json["outcome"], "timed_out");

    config::set_trace_mode(TraceMode::Off);
    let before = trace::events_for(addr).len();
    time_out_once(&m);
    assert_eq!(trace::events_for(addr).len(), before);

    config::set_trace_mode(TraceMode::Ring);
    time_out_once(&m);
    assert!(trace::events_for(addr).len() > before);
    trace::ring().drain();
    assert!(trace::events_for(addr).is_empty());
}
