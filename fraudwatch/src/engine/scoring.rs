// fraudwatch/src/engine/scoring.rs
//
// ScoringEngine: FeatureVector → Decision.
//
//   label = Fraud  if probability >= threshold   (closed upper bound)
//           Legit  otherwise
//
// The engine never fails its caller. No model loaded, a model error, a
// panic inside the model, or a probability outside [0, 1] all resolve to
// the fail-safe decision (label 0) and bump a counter.
//
// Threshold precedence: the configured threshold wins; the artifact's
// recommended threshold is used only when none is configured, and 0.5 when
// neither is set. A mismatch between the two is logged at startup since the
// model and its threshold are meant to be versioned together.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, info, warn};

use crate::config::ScoringConfig;
use crate::error::ScoringError;
use crate::events::{Decision, FailSafeReason, Label};
use crate::features::FeatureVector;
use crate::model::LoadedModel;

pub const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Default)]
pub struct ScoringStats {
    pub scored:      AtomicU64,
    pub flagged:     AtomicU64,
    pub unavailable: AtomicU64,
    pub failures:    AtomicU64,
}

pub struct ScoringEngine {
    model:     Option<LoadedModel>,
    threshold: f64,
    pub stats: ScoringStats,
}

impl ScoringEngine {
    pub fn new(model: LoadedModel, configured: Option<f64>) -> Self {
        let threshold = match (configured, model.threshold) {
            (Some(c), Some(a)) if (c - a).abs() > f64::EPSILON => {
                warn!(configured = c, artifact = a, model = %model.name,
                      "Threshold differs from the model artifact; using configured value");
                c
            }
            (Some(c), _)    => c,
            (None, Some(a)) => a,
            (None, None)    => DEFAULT_THRESHOLD,
        };
        info!(model = %model.name, version = %model.version, threshold, "Scoring engine ready");
        Self { model: Some(model), threshold, stats: ScoringStats::default() }
    }

    /// Engine with no model: every decision is fail-safe.
    pub fn fail_safe_only(threshold: f64) -> Self {
        warn!("Scoring engine running fail-safe only; every transaction is labelled 0");
        Self { model: None, threshold, stats: ScoringStats::default() }
    }

    /// Load the configured artifact. A load failure is returned unless
    /// fail-safe-only operation is explicitly allowed.
    pub fn from_config(cfg: &ScoringConfig) -> Result<Self, ScoringError> {
        let Some(path) = cfg.model_path.as_deref() else {
            if cfg.allow_fail_safe_only {
                return Ok(Self::fail_safe_only(cfg.threshold.unwrap_or(DEFAULT_THRESHOLD)));
            }
            return Err(ScoringError::ModelUnavailable("no model path configured".into()));
        };
        match LoadedModel::from_path(path) {
            Ok(model) => Ok(Self::new(model, cfg.threshold)),
            Err(e) if cfg.allow_fail_safe_only => {
                error!(path = %path.display(), error = %e, "Model load failed");
                Ok(Self::fail_safe_only(cfg.threshold.unwrap_or(DEFAULT_THRESHOLD)))
            }
            Err(e) => Err(e),
        }
    }

    pub fn threshold(&self) -> f64 { self.threshold }
    pub fn is_available(&self) -> bool { self.model.is_some() }

    pub fn label_for(&self, probability: f64) -> Label {
        if probability >= self.threshold { Label::Fraud } else { Label::Legit }
    }

    pub fn score(&self, fv: &FeatureVector) -> Decision {
        let Some(model) = &self.model else {
            self.stats.unavailable.fetch_add(1, Ordering::Relaxed);
            return Decision::fail_safe(FailSafeReason::ModelUnavailable);
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| model.model.predict_proba(fv)))
            .unwrap_or_else(|_| Err(ScoringError::ScoringFailure("model panicked".into())))
            .and_then(|p| {
                if (0.0..=1.0).contains(&p) { Ok(p) }
                else { Err(ScoringError::ScoringFailure(format!("probability {p} out of range"))) }
            });

        match outcome {
            Ok(probability) => {
                self.stats.scored.fetch_add(1, Ordering::Relaxed);
                let label = self.label_for(probability);
                if label == Label::Fraud {
                    self.stats.flagged.fetch_add(1, Ordering::Relaxed);
                }
                Decision { probability, label, fail_safe: None }
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Scoring failed, using fail-safe label");
                Decision::fail_safe(FailSafeReason::ScoringFailure)
            }
        }
    }
}
