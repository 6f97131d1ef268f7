//! Shared reporting for the criterion benches in `benches/`.
//!
//! Each bench records per-sample ns/op and prints one summary line with
//! percentiles, tagged with the tunables the run resolved from the
//! environment.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use frankensync_core::config::{self, TraceMode};

#[derive(Default)]
pub struct BenchStats {
    samples_ns_per_op: Vec<f64>,
    total_iters: u64,
    total_ns: u128,
}

impl BenchStats {
    pub fn record(&mut self, iters: u64, dur: Duration) {
        let ns = dur.as_nanos();
        self.total_iters = self.total_iters.saturating_add(iters);
        self.total_ns = self.total_ns.saturating_add(ns);
        self.samples_ns_per_op.push(ns as f64 / iters.max(1) as f64);
    }

    pub fn report(&self, prefix: &str, bench_label: &str) {
        let mut samples = self.samples_ns_per_op.clone();
        if samples.is_empty() {
            return;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let p50 = percentile_sorted(&samples, 0.50);
        let p95 = percentile_sorted(&samples, 0.95);
        let p99 = percentile_sorted(&samples, 0.99);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let throughput_ops_s = if self.total_ns == 0 {
            0.0
        } else {
            (self.total_iters as f64) / (self.total_ns as f64 / 1e9)
        };

        println!(
            "{prefix} mode={} bench={bench_label} samples={} p50_ns_op={p50:.3} p95_ns_op={p95:.3} p99_ns_op={p99:.3} mean_ns_op={mean:.3} throughput_ops_s={throughput_ops_s:.3}",
            mode_label(),
            samples.len(),
        );
    }
}

/// Run `op` `iters` times and record the batch; returns the duration for
/// criterion's `iter_custom`.
pub fn time_batch(stats: &RefCell<BenchStats>, iters: u64, mut op: impl FnMut()) -> Duration {
    let start = Instant::now();
    for _ in 0..iters {
        op();
    }
    let dur = start.elapsed().max(Duration::from_nanos(1));
    stats.borrow_mut().record(iters, dur);
    dur
}

pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    debug_assert!((0.0..=1.0).contains(&p));
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Trace mode in effect; tracing only touches slow paths but tags every run.
pub fn mode_label() -> &'static str {
    match config::trace_mode() {
        TraceMode::Off => "trace_off",
        TraceMode::Ring => "trace_ring",
        TraceMode::Stderr => "trace_stderr",
    }
}

/// Print the raw tunables once per bench binary.
pub fn print_env_metadata_once(prefix: &str) {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let raw = |key: &str| std::env::var(key).unwrap_or_else(|_| "<unset>".to_string());
        println!(
            "{prefix}_META spin_count_env={} elision_env={} trace_env={} spin_count={} elision={}",
            raw(config::ENV_SPIN_COUNT),
            raw(config::ENV_ELISION),
            raw(config::ENV_TRACE),
            config::spin_count(),
            config::elision_enabled(),
        );
    });
}
