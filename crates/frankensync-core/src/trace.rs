//! Structured evidence for slow-path transitions.
//!
//! Fast paths never record anything. Contended blocks, timeouts, owner-died
//! takeovers, rwlock handovers and similar transitions publish a
//! [`SyncEvent`] into a fixed-size overwrite-on-full ring. In
//! [`TraceMode::Stderr`] every event is also written as one JSON line.
//!
//! Writer protocol (single event):
//! 1. allocate global `seqno`
//! 2. write the event into its slot under the slot mutex
//! 3. publish `seqno` with `Release`
//!
//! Readers accept a slot only if its published `seqno` is stable across the copy.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::{self, TraceMode};

/// Capacity of the process-wide ring.
pub const RING_CAPACITY: usize = 256;

/// Primitive family an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFamily {
    Mutex,
    RwLock,
    Cond,
    Once,
    Cancel,
}

/// One recorded slow-path transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncEvent {
    pub seqno: u64,
    pub family: SyncFamily,
    pub op: &'static str,
    pub addr: usize,
    pub tid: u32,
    pub outcome: &'static str,
}

impl SyncEvent {
    /// One JSON object, no trailing newline.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

struct EventSlot {
    published_seqno: AtomicU64,
    event: Mutex<Option<SyncEvent>>,
}

impl EventSlot {
    const fn new() -> Self {
        Self {
            published_seqno: AtomicU64::new(0),
            event: parking_lot::const_mutex(None),
        }
    }
}

/// Overwrite-on-full event ring.
pub struct EventRing<const CAP: usize> {
    next_seqno: AtomicU64,
    slots: [EventSlot; CAP],
}

impl<const CAP: usize> Default for EventRing<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> EventRing<CAP> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_seqno: AtomicU64::new(0),
            slots: [const { EventSlot::new() }; CAP],
        }
    }

    fn allocate_seqno(&self) -> u64 {
        self.next_seqno
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Store `event` with a fresh sequence number and return the stamped copy.
    pub fn publish(&self, mut event: SyncEvent) -> SyncEvent {
        let seqno = self.allocate_seqno();
        event.seqno = seqno;
        let slot = &self.slots[(seqno as usize) % CAP];
        *slot.event.lock() = Some(event);
        slot.published_seqno.store(seqno, Ordering::Release);
        event
    }

    /// All stable events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        for slot in &self.slots {
            let s1 = slot.published_seqno.load(Ordering::Acquire);
            if s1 == 0 {
                continue;
            }
            let ev = *slot.event.lock();
            let s2 = slot.published_seqno.load(Ordering::Acquire);
            match ev {
                Some(ev) if s1 == s2 && ev.seqno == s1 => out.push(ev),
                _ => {}
            }
        }
        out.sort_by_key(|e| e.seqno);
        out
    }

    /// Snapshot then empty the ring.
    pub fn drain(&self) -> Vec<SyncEvent> {
        let out = self.snapshot();
        for slot in &self.slots {
            let mut guard = slot.event.lock();
            *guard = None;
            slot.published_seqno.store(0, Ordering::Release);
        }
        out
    }
}

static RING: EventRing<RING_CAPACITY> = EventRing::new();

/// Process-wide ring.
pub fn ring() -> &'static EventRing<RING_CAPACITY> {
    &RING
}

/// Record a slow-path transition on `addr` according to the trace mode.
pub(crate) fn record(family: SyncFamily, op: &'static str, addr: usize, outcome: &'static str) {
    let mode = config::trace_mode();
    if mode == TraceMode::Off {
        return;
    }
    let event = RING.publish(SyncEvent {
        seqno: 0,
        family,
        op,
        addr,
        tid: crate::pthread::thread::current_tid(),
        outcome,
    });
    if mode == TraceMode::Stderr {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", event.to_json());
    }
}

/// Events recorded against one object, oldest first.
pub fn events_for(addr: usize) -> Vec<SyncEvent> {
    RING.snapshot()
        .into_iter()
        .filter(|e| e.addr == addr)
        .collect()
}
