//! Process-wide tunables.
//!
//! Each tunable is resolved from its environment variable on first read and
//! cached in an atomic; later reads never touch the environment again.
//! Tests pin values with the `set_*` overrides.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

pub const ENV_SPIN_COUNT: &str = "FRANKENSYNC_SPIN_COUNT";
pub const ENV_ELISION: &str = "FRANKENSYNC_ELISION";
pub const ENV_TRACE: &str = "FRANKENSYNC_TRACE";

/// Default adaptive spin bound.
pub const DEFAULT_ADAPTIVE_COUNT: u32 = 100;
/// Upper clamp for the spin bound.
pub const MAX_ADAPTIVE_COUNT: u32 = 32_767;

const UNRESOLVED: u32 = u32::MAX;
const FLAG_UNRESOLVED: u8 = 0xFF;

const ELISION_OFF: u8 = 0;
const ELISION_ON: u8 = 1;

const TRACE_OFF: u8 = 0;
const TRACE_RING: u8 = 1;
const TRACE_STDERR: u8 = 2;

static SPIN_COUNT: AtomicU32 = AtomicU32::new(UNRESOLVED);
static ELISION: AtomicU8 = AtomicU8::new(FLAG_UNRESOLVED);
static TRACE: AtomicU8 = AtomicU8::new(FLAG_UNRESOLVED);

/// Where slow-path events go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMode {
    /// Drop every event.
    Off,
    /// Keep the most recent events in the in-process ring.
    #[default]
    Ring,
    /// Ring plus one JSON line per event on stderr.
    Stderr,
}

fn trace_to_u8(mode: TraceMode) -> u8 {
    match mode {
        TraceMode::Off => TRACE_OFF,
        TraceMode::Ring => TRACE_RING,
        TraceMode::Stderr => TRACE_STDERR,
    }
}

fn u8_to_trace(v: u8) -> TraceMode {
    match v {
        TRACE_OFF => TraceMode::Off,
        TRACE_STDERR => TraceMode::Stderr,
        _ => TraceMode::Ring,
    }
}

pub(crate) fn parse_spin_count(raw: &str) -> u32 {
    match raw.trim().parse::<i64>() {
        Ok(v) => v.clamp(0, i64::from(MAX_ADAPTIVE_COUNT)) as u32,
        Err(_) => DEFAULT_ADAPTIVE_COUNT,
    }
}

pub(crate) fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "on" | "yes" | "true"
    )
}

pub(crate) fn parse_trace_mode(raw: &str) -> TraceMode {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" | "0" => TraceMode::Off,
        "stderr" | "jsonl" => TraceMode::Stderr,
        _ => TraceMode::Ring,
    }
}

/// Adaptive mutex spin bound.
pub fn spin_count() -> u32 {
    let cached = SPIN_COUNT.load(Ordering::Relaxed);
    if cached != UNRESOLVED {
        return cached;
    }
    let resolved = std::env::var(ENV_SPIN_COUNT)
        .map(|raw| parse_spin_count(&raw))
        .unwrap_or(DEFAULT_ADAPTIVE_COUNT);
    // A racing resolver computes the same value; first store wins.
    let _ = SPIN_COUNT.compare_exchange(UNRESOLVED, resolved, Ordering::Relaxed, Ordering::Relaxed);
    SPIN_COUNT.load(Ordering::Relaxed)
}

/// Whether elision-hinted mutexes should try the elided fast path.
pub fn elision_enabled() -> bool {
    let cached = ELISION.load(Ordering::Relaxed);
    if cached != FLAG_UNRESOLVED {
        return cached == ELISION_ON;
    }
    let on = std::env::var(ENV_ELISION)
        .map(|raw| parse_flag(&raw))
        .unwrap_or(false);
    let v = if on { ELISION_ON } else { ELISION_OFF };
    let _ = ELISION.compare_exchange(FLAG_UNRESOLVED, v, Ordering::Relaxed, Ordering::Relaxed);
    ELISION.load(Ordering::Relaxed) == ELISION_ON
}

pub fn trace_mode() -> TraceMode {
    let cached = TRACE.load(Ordering::Relaxed);
    if cached != FLAG_UNRESOLVED {
        return u8_to_trace(cached);
    }
    let mode = std::env::var(ENV_TRACE)
        .map(|raw| parse_trace_mode(&raw))
        .unwrap_or_default();
    let _ = TRACE.compare_exchange(
        FLAG_UNRESOLVED,
        trace_to_u8(mode),
        Ordering::Relaxed,
        Ordering::Relaxed,
    );
    u8_to_trace(TRACE.load(Ordering::Relaxed))
}

pub fn set_spin_count(count: u32) {
    SPIN_COUNT.store(count.min(MAX_ADAPTIVE_COUNT), Ordering::Relaxed);
}

pub fn set_elision(enabled: bool) {
    ELISION.store(
        if enabled { ELISION_ON } else { ELISION_OFF },
        Ordering::Relaxed,
    );
}

pub fn set_trace_mode(mode: TraceMode) {
    TRACE.store(trace_to_u8(mode), Ordering::Relaxed);
}
