// fraudwatch/src/encoding.rs
//
// Read-only target-encoding table for high-cardinality categoricals
// (merchant, city, state, acct_num, ssn). Produced offline, loaded once at
// startup:
//
//   { "global_mean": 0.0029,
//     "features": { "merchant": { "fraud_Kirlin and Sons": 0.012, ... },
//                   "city":     { ... },
//                   "state":    { ... } } }
//
// Any value not in the table, and every lookup when no table is configured,
// resolves to the global mean.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Base fraud rate of the training population.
pub const DEFAULT_GLOBAL_MEAN: f64 = 0.0029;

fn default_global_mean() -> f64 { DEFAULT_GLOBAL_MEAN }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEncodings {
    #[serde(default = "default_global_mean")]
    pub global_mean: f64,
    #[serde(default)]
    pub features:    HashMap<String, HashMap<String, f64>>,
}

impl Default for TargetEncodings {
    fn default() -> Self {
        Self { global_mean: DEFAULT_GLOBAL_MEAN, features: HashMap::new() }
    }
}

impl TargetEncodings {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading target encodings {}", path.display()))?;
        let enc: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing target encodings {}", path.display()))?;
        if !enc.global_mean.is_finite() {
            anyhow::bail!("target encodings {}: global_mean is not finite", path.display());
        }
        info!(
            path     = %path.display(),
            features = enc.features.len(),
            values   = enc.features.values().map(HashMap::len).sum::<usize>(),
            "Target encodings loaded"
        );
        Ok(enc)
    }

    /// Encoded value for `feature = value`, or the global mean.
    pub fn lookup(&self, feature: &str, value: Option<&str>) -> f64 {
        value
            .and_then(|v| self.features.get(feature)?.get(v))
            .copied()
            .filter(|x| x.is_finite())
            .unwrap_or(self.global_mean)
    }
}
