// fraudwatch/src/metrics.rs
//
// Pipeline counters. Plain atomics bumped on the hot path; the stats loop in
// main reads them into a StatsSnapshot and logs it.
//
// Probability buckets: [0.0, 0.1), [0.1, 0.2), ... [0.9, 1.0]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub received:         AtomicU64,
    pub processed:        AtomicU64,
    pub malformed:        AtomicU64,
    pub timeouts:         AtomicU64,
    pub store_fallbacks:  AtomicU64,
    pub commit_failures:  AtomicU64,
    pub persist_failures: AtomicU64,
    latency_us_sum:       AtomicU64,
    latency_us_max:       AtomicU64,
    probability_buckets:  [AtomicU64; 10],
}

impl PipelineMetrics {
    pub fn new() -> Self { Self::default() }

    pub fn record_latency(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.latency_us_sum.fetch_add(us, Ordering::Relaxed);
        self.latency_us_max.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_probability(&self, p: f64) {
        let bucket = ((p.clamp(0.0, 1.0) * 10.0) as usize).min(9);
        self.probability_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn probability_histogram(&self) -> [u64; 10] {
        std::array::from_fn(|i| self.probability_buckets[i].load(Ordering::Relaxed))
    }

    pub fn mean_latency_ms(&self) -> f64 {
        let n = self.processed.load(Ordering::Relaxed);
        if n == 0 { return 0.0; }
        self.latency_us_sum.load(Ordering::Relaxed) as f64 / n as f64 / 1000.0
    }

    pub fn max_latency_ms(&self) -> f64 {
        self.latency_us_max.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Point-in-time view across every component's counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs:      f64,
    pub received:         u64,
    pub processed:        u64,
    pub flagged:          u64,
    pub malformed:        u64,
    pub fail_safe:        u64,
    pub timeouts:         u64,
    pub store_fallbacks:  u64,
    pub state_loss:       u64,
    pub commit_failures:  u64,
    pub notify_dropped:   u64,
    pub notify_failed:    u64,
    pub persist_failures: u64,
    pub entities:         usize,
    pub mean_latency_ms:  f64,
    pub max_latency_ms:   f64,
}

impl StatsSnapshot {
    pub fn events_per_sec(&self) -> f64 {
        if self.uptime_secs <= 0.0 { 0.0 } else { self.processed as f64 / self.uptime_secs }
    }

    pub fn log(&self) {
        info!(
            uptime_s        = format_args!("{:.0}", self.uptime_secs),
            received        = self.received,
            processed       = self.processed,
            eps             = format_args!("{:.1}", self.events_per_sec()),
            flagged         = self.flagged,
            malformed       = self.malformed,
            fail_safe       = self.fail_safe,
            timeouts        = self.timeouts,
            store_fallbacks = self.store_fallbacks,
            state_loss      = self.state_loss,
            notify_dropped  = self.notify_dropped,
            notify_failed   = self.notify_failed,
            persist_failed  = self.persist_failures,
            entities        = self.entities,
            mean_ms         = format_args!("{:.2}", self.mean_latency_ms),
            max_ms          = format_args!("{:.2}", self.max_latency_ms),
            "stats"
        );
    }
}
