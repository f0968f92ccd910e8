// fraudwatch/src/model/mod.rs
//
// Opaque classifier behind `Model::predict_proba`.
//
// Artifacts are JSON, loaded once at startup:
//
//   { "name": "robica", "version": "4.0", "threshold": 0.82,
//     "model": { "kind": "logistic", ... } }          → logistic::LogisticModel
//     "model": { "kind": "tree_ensemble", ... }       → trees::TreeEnsemble
//
// Feature names are resolved to schema slots when the artifact is compiled,
// so a typo fails at startup instead of silently scoring zeros.

pub mod logistic;
pub mod trees;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ScoringError;
use crate::features::{FeatureVector, FEATURE_SCHEMA_VERSION};

pub use logistic::{LogisticModel, LogisticSpec};
pub use trees::{TreeEnsemble, TreeEnsembleSpec};

pub trait Model: Send + Sync {
    /// Fraud probability in [0, 1].
    fn predict_proba(&self, fv: &FeatureVector) -> Result<f64, ScoringError>;
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Where a named feature lives in a `FeatureVector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Numeric(usize),
    Categorical(usize),
}

pub(crate) fn resolve(name: &str) -> Result<Slot, ScoringError> {
    FeatureVector::numeric_index(name)
        .map(Slot::Numeric)
        .or_else(|| FeatureVector::categorical_index(name).map(Slot::Categorical))
        .ok_or_else(|| ScoringError::InvalidArtifact(format!("unknown feature {name:?}")))
}

pub(crate) fn resolve_numeric(name: &str) -> Result<usize, ScoringError> {
    match resolve(name)? {
        Slot::Numeric(i) => Ok(i),
        Slot::Categorical(_) => Err(ScoringError::InvalidArtifact(format!("{name:?} is categorical"))),
    }
}

pub(crate) fn resolve_categorical(name: &str) -> Result<usize, ScoringError> {
    match resolve(name)? {
        Slot::Categorical(i) => Ok(i),
        Slot::Numeric(_) => Err(ScoringError::InvalidArtifact(format!("{name:?} is numeric"))),
    }
}

// ── Artifact ──────────────────────────────────────────────────────────────────

fn default_schema() -> u32 { FEATURE_SCHEMA_VERSION }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Logistic(LogisticSpec),
    TreeEnsemble(TreeEnsembleSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name:           String,
    pub version:        String,
    #[serde(default)]
    pub threshold:      Option<f64>,
    #[serde(default = "default_schema")]
    pub schema_version: u32,
    pub model:          ModelSpec,
}

/// A compiled artifact, ready to score.
#[derive(Clone)]
pub struct LoadedModel {
    pub name:      String,
    pub version:   String,
    pub threshold: Option<f64>,
    pub model:     Arc<dyn Model>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl ModelArtifact {
    /// Read an artifact. A missing or unreadable file is `ModelUnavailable`;
    /// a file that does not parse is `InvalidArtifact`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScoringError> {
        let path = path.as_ref();
        let raw  = std::fs::read_to_string(path)
            .map_err(|e| ScoringError::ModelUnavailable(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ScoringError> {
        serde_json::from_str(raw).map_err(|e| ScoringError::InvalidArtifact(e.to_string()))
    }

    pub fn compile(self) -> Result<LoadedModel, ScoringError> {
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(ScoringError::InvalidArtifact(format!(
                "feature schema v{} does not match v{FEATURE_SCHEMA_VERSION}",
                self.schema_version
            )));
        }
        if let Some(t) = self.threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(ScoringError::InvalidArtifact(format!("threshold {t} outside [0, 1]")));
            }
        }
        let model: Arc<dyn Model> = match self.model {
            ModelSpec::Logistic(spec)     => Arc::new(LogisticModel::compile(&spec)?),
            ModelSpec::TreeEnsemble(spec) => Arc::new(TreeEnsemble::compile(&spec)?),
        };
        info!(name = %self.name, version = %self.version, threshold = ?self.threshold, "Model compiled");
        Ok(LoadedModel { name: self.name, version: self.version, threshold: self.threshold, model })
    }
}

impl LoadedModel {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScoringError> {
        ModelArtifact::from_path(path)?.compile()
    }
}
