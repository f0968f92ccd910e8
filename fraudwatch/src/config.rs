// fraudwatch/src/config.rs
//
// Startup configuration. Built once (JSON file and/or CLI flags), validated,
// then shared read-only; nothing here is hot-reloadable.
//
//   store     - entity-state backend url + pool + write retry policy
//   pipeline  - worker count, queue depth, per-event budget, stats cadence
//   scoring   - model artifact, threshold, fail-safe-only switch, encodings
//   windows   - velocity horizons
//   notify    - notification target
//   persist   - processed-transaction sink
//   features  - default-value policy
//   source    - inbound stream

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::features::FeatureDefaults;
use crate::source::ReconnectPolicy;
use crate::state::entity::Horizons;
use crate::state::store::RetryPolicy;
use crate::state::window::{W_15MIN, W_1HR, W_24HR};

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory` or `sqlite://<path>`
    pub url:            String,
    pub pool_size:      usize,
    pub retry_attempts: u32,
    pub retry_base_ms:  u64,
    pub retry_max_ms:   u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url:            "memory".into(),
            pool_size:      4,
            retry_attempts: 4,
            retry_base_ms:  20,
            retry_max_ms:   500,
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts:   self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay:  Duration::from_millis(self.retry_max_ms),
        }
    }

    pub fn sqlite_path(&self) -> Option<&str> {
        self.url.trim().strip_prefix("sqlite://")
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers:             usize,
    pub queue_capacity:      usize,
    pub event_budget_ms:     u64,
    pub stats_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { workers: 100, queue_capacity: 16384, event_budget_ms: 50, stats_interval_secs: 30 }
    }
}

impl PipelineConfig {
    pub fn event_budget(&self) -> Duration { Duration::from_millis(self.event_budget_ms) }
}

// ── Scoring ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub model_path:           Option<PathBuf>,
    /// Overrides the artifact's recommended threshold.
    pub threshold:            Option<f64>,
    /// Run with every decision fail-safe when the model cannot be loaded.
    pub allow_fail_safe_only: bool,
    pub encodings_path:       Option<PathBuf>,
}

// ── Windows ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub burst_secs: i64,
    pub short_secs: i64,
    pub long_secs:  i64,
}

impl Default for WindowConfig {
    fn default() -> Self { Self { burst_secs: W_15MIN, short_secs: W_1HR, long_secs: W_24HR } }
}

impl WindowConfig {
    pub fn horizons(&self) -> Horizons {
        Horizons {
            burst: chrono::Duration::seconds(self.burst_secs),
            short: chrono::Duration::seconds(self.short_secs),
            long:  chrono::Duration::seconds(self.long_secs),
        }
    }
}

// ── Notify / persist ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NotifyKind {
    #[default]
    Log,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub kind:           NotifyKind,
    pub path:           Option<PathBuf>,
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self { Self { kind: NotifyKind::Log, path: None, queue_capacity: 8192 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PersistKind {
    #[default]
    None,
    Jsonl,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub kind:      PersistKind,
    pub path:      Option<PathBuf>,
    pub pool_size: usize,
}

impl Default for PersistConfig {
    fn default() -> Self { Self { kind: PersistKind::None, path: None, pool_size: 2 } }
}

// ── Source ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Tail,    // follow a live JSONL file
    Replay,  // captured file at scaled speed
    Batch,   // read a file once and exit
    Tcp,     // newline-delimited JSON over TCP
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind:              SourceKind,
    pub path:              PathBuf,
    pub seek_end:          bool,
    pub speed:             f64,
    pub addr:              String,
    pub max_reconnects:    u32,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms:  u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind:              SourceKind::Tail,
            path:              PathBuf::from("/tmp/fraudwatch_feed.jsonl"),
            seek_end:          true,
            speed:             1.0,
            addr:              "127.0.0.1:9400".into(),
            max_reconnects:    10,
            reconnect_base_ms: 250,
            reconnect_cap_ms:  30_000,
        }
    }
}

impl SourceConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base:         Duration::from_millis(self.reconnect_base_ms),
            cap:          Duration::from_millis(self.reconnect_cap_ms),
            max_attempts: self.max_reconnects,
        }
    }
}

// ── App ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store:    StoreConfig,
    pub pipeline: PipelineConfig,
    pub scoring:  ScoringConfig,
    pub windows:  WindowConfig,
    pub notify:   NotifyConfig,
    pub persist:  PersistConfig,
    pub features: FeatureDefaults,
    pub source:   SourceConfig,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw  = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.queue_capacity == 0 || self.notify.queue_capacity == 0 {
            bail!("queue capacities must be at least 1");
        }
        if self.pipeline.event_budget_ms == 0 {
            bail!("pipeline.event_budget_ms must be positive");
        }
        if let Some(t) = self.scoring.threshold {
            if !(0.0..=1.0).contains(&t) {
                bail!("scoring.threshold {t} outside [0, 1]");
            }
        }
        let w = &self.windows;
        if w.burst_secs <= 0 || w.short_secs <= 0 || w.long_secs <= 0 {
            bail!("window horizons must be positive");
        }
        if w.burst_secs >= w.short_secs || w.short_secs >= w.long_secs {
            bail!("window horizons must satisfy burst_secs < short_secs < long_secs");
        }
        if self.store.pool_size == 0 || self.store.retry_attempts == 0 {
            bail!("store.pool_size and store.retry_attempts must be at least 1");
        }
        let url = self.store.url.trim();
        if !(url.is_empty() || url.starts_with("memory") || url.starts_with("sqlite://")) {
            bail!("store.url {url:?}: expected memory or sqlite://<path>");
        }
        if !(self.features.min_denominator > 0.0) {
            bail!("features.min_denominator must be positive");
        }
        if !(self.source.speed > 0.0) {
            bail!("source.speed must be positive");
        }
        if self.notify.kind == NotifyKind::Jsonl && self.notify.path.is_none() {
            bail!("notify.path is required for the jsonl target");
        }
        Ok(())
    }
}
