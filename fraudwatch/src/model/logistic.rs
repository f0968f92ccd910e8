// fraudwatch/src/model/logistic.rs
//
// Logistic regression over the fixed schema:
//   z = intercept + Σ w_i · numeric_i + Σ w[categorical_j = value]
//   p = sigmoid(z)
// Categorical values absent from the weight table contribute 0.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::ScoringError;
use crate::features::FeatureVector;
use crate::model::{resolve_categorical, resolve_numeric, sigmoid, Model};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogisticSpec {
    pub intercept:   f64,
    #[serde(default)]
    pub weights:     BTreeMap<String, f64>,
    #[serde(default)]
    pub categorical: BTreeMap<String, BTreeMap<String, f64>>,
}

pub struct LogisticModel {
    intercept:   f64,
    weights:     Vec<(usize, f64)>,
    categorical: Vec<(usize, HashMap<String, f64>)>,
}

impl LogisticModel {
    pub fn compile(spec: &LogisticSpec) -> Result<Self, ScoringError> {
        let finite = |name: &str, w: f64| {
            if w.is_finite() { Ok(w) }
            else { Err(ScoringError::InvalidArtifact(format!("weight for {name:?} is not finite"))) }
        };

        let weights = spec.weights.iter()
            .map(|(name, w)| Ok((resolve_numeric(name)?, finite(name, *w)?)))
            .collect::<Result<Vec<_>, ScoringError>>()?;

        let categorical = spec.categorical.iter()
            .map(|(name, table)| {
                let slot = resolve_categorical(name)?;
                let table = table.iter()
                    .map(|(v, w)| Ok((v.clone(), finite(name, *w)?)))
                    .collect::<Result<HashMap<_, _>, ScoringError>>()?;
                Ok((slot, table))
            })
            .collect::<Result<Vec<_>, ScoringError>>()?;

        Ok(Self { intercept: finite("intercept", spec.intercept)?, weights, categorical })
    }
}

impl Model for LogisticModel {
    fn predict_proba(&self, fv: &FeatureVector) -> Result<f64, ScoringError> {
        let num = fv.numeric();
        let cat = fv.categorical();

        let mut z = self.intercept;
        for &(i, w) in &self.weights {
            z += w * num[i];
        }
        for (i, table) in &self.categorical {
            z += table.get(&cat[*i]).copied().unwrap_or(0.0);
        }
        if z.is_nan() {
            return Err(ScoringError::ScoringFailure("linear term is NaN".into()));
        }
        Ok(sigmoid(z))
    }
}
