// fraudwatch/src/state/window.rs
//
// Incremental statistics primitives shared by every entity state.
//
//   TimeWindow  - trailing-horizon event timestamps (velocity counts)
//   Expanding   - running count / sum / max over all history, O(1) update
//   Rolling     - fixed-capacity FIFO of the last N values
//   Tally       - per-key visit counter (merchants)
//   KeyedStats  - per-key Expanding (categories)
//
// Nothing here rescans history: every update is O(1) amortised, and
// TimeWindow pruning pops from the front of an ordered deque.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ── Window durations ──────────────────────────────────────────────────────────

pub const W_15MIN: i64 = 15 * 60;
pub const W_1HR:   i64 = 60 * 60;
pub const W_24HR:  i64 = 24 * 60 * 60;

/// Hard cap on retained timestamps per window. A card doing more than this
/// inside one horizon saturates rather than growing without bound.
pub const MAX_WINDOW_POINTS: usize = 4096;

// ── Time window ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    points: VecDeque<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new() -> Self { Self::default() }

    /// Append a data point. Points normally arrive in time order; a late
    /// point is inserted at its sorted position so pruning stays a prefix pop.
    pub fn observe(&mut self, ts: DateTime<Utc>) {
        match self.points.back() {
            Some(last) if ts < *last => {
                let idx = self.points.partition_point(|p| *p <= ts);
                self.points.insert(idx, ts);
            }
            _ => self.points.push_back(ts),
        }
        while self.points.len() > MAX_WINDOW_POINTS {
            self.points.pop_front();
        }
    }

    /// Drop every point older than `now - horizon`.
    pub fn prune(&mut self, now: DateTime<Utc>, horizon: Duration) {
        let cutoff = now - horizon;
        while self.points.front().map(|p| *p < cutoff).unwrap_or(false) {
            self.points.pop_front();
        }
    }

    /// Points in `[now - horizon, now)`, pruning expired ones as a side effect.
    pub fn count_since(&mut self, now: DateTime<Utc>, horizon: Duration) -> usize {
        self.prune(now, horizon);
        self.count_in(now, horizon)
    }

    /// Same count as `count_since` without touching the window.
    pub fn count_in(&self, now: DateTime<Utc>, horizon: Duration) -> usize {
        let cutoff = now - horizon;
        let lo = self.points.partition_point(|p| *p < cutoff);
        let hi = self.points.partition_point(|p| *p < now);
        hi.saturating_sub(lo)
    }

    pub fn len(&self) -> usize { self.points.len() }
    pub fn is_empty(&self) -> bool { self.points.is_empty() }
}

// ── Expanding statistics ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expanding {
    pub count: u64,
    pub sum:   f64,
    pub max:   Option<f64>,
}

impl Expanding {
    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum   += value;
        self.max    = Some(self.max.map_or(value, |m| m.max(value)));
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn max(&self) -> Option<f64> { self.max }

    /// Mean, or `fallback` for an entity with no history.
    pub fn mean_or(&self, fallback: f64) -> f64 { self.mean().unwrap_or(fallback) }
    pub fn max_or(&self, fallback: f64) -> f64 { self.max.unwrap_or(fallback) }
}

// ── Rolling FIFO ──────────────────────────────────────────────────────────────

pub const ROLLING_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rolling {
    capacity: usize,
    values:   VecDeque<f64>,
}

impl Default for Rolling {
    fn default() -> Self { Self::with_capacity(ROLLING_LEN) }
}

impl Rolling {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, values: VecDeque::with_capacity(capacity) }
    }

    pub fn observe(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() { return None; }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
    pub fn capacity(&self) -> usize { self.capacity }
}

// ── Keyed tallies ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    counts: HashMap<String, u64>,
}

impl Tally {
    pub fn bump(&mut self, key: &str) {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn distinct(&self) -> usize { self.counts.len() }

    /// Distinct keys once `key` is counted too.
    pub fn distinct_with(&self, key: &str) -> usize {
        self.distinct() + usize::from(self.get(key) == 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyedStats {
    stats: HashMap<String, Expanding>,
}

impl KeyedStats {
    pub fn observe(&mut self, key: &str, value: f64) {
        self.stats.entry(key.to_string()).or_default().observe(value);
    }

    pub fn get(&self, key: &str) -> Option<&Expanding> { self.stats.get(key) }

    pub fn distinct(&self) -> usize { self.stats.len() }
}
