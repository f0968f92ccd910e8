// fraudwatch/src/model/trees.rs
//
// Gradient-boosted tree ensemble.
//
// Each tree is a flat node list, root at index 0. Split nodes send a sample
// left when `numeric <= threshold` or `categorical ∈ values`, right
// otherwise. Children must sit at a higher index than their parent, which
// makes every walk terminate.
//
//   p = sigmoid(base_score + Σ leaf_value)

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ScoringError;
use crate::features::FeatureVector;
use crate::model::{resolve_categorical, resolve_numeric, sigmoid, Model};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    Leaf        { leaf: f64 },
    Numeric     { feature: String, threshold: f64, left: usize, right: usize },
    Categorical { feature: String, values: Vec<String>, left: usize, right: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSpec {
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeEnsembleSpec {
    #[serde(default)]
    pub base_score: f64,
    pub trees:      Vec<TreeSpec>,
}

enum Node {
    Leaf(f64),
    Numeric     { slot: usize, threshold: f64, left: usize, right: usize },
    Categorical { slot: usize, values: HashSet<String>, left: usize, right: usize },
}

pub struct TreeEnsemble {
    base_score: f64,
    trees:      Vec<Vec<Node>>,
}

fn invalid(tree: usize, msg: String) -> ScoringError {
    ScoringError::InvalidArtifact(format!("tree {tree}: {msg}"))
}

fn check_children(tree: usize, idx: usize, left: usize, right: usize, len: usize) -> Result<(), ScoringError> {
    for child in [left, right] {
        if child <= idx || child >= len {
            return Err(invalid(tree, format!("node {idx} has bad child {child}")));
        }
    }
    Ok(())
}

impl TreeEnsemble {
    pub fn compile(spec: &TreeEnsembleSpec) -> Result<Self, ScoringError> {
        if !spec.base_score.is_finite() {
            return Err(ScoringError::InvalidArtifact("base_score is not finite".into()));
        }
        let mut trees = Vec::with_capacity(spec.trees.len());
        for (t, tree) in spec.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(invalid(t, "no nodes".into()));
            }
            let len = tree.nodes.len();
            let mut nodes = Vec::with_capacity(len);
            for (i, n) in tree.nodes.iter().enumerate() {
                nodes.push(match n {
                    NodeSpec::Leaf { leaf } => {
                        if !leaf.is_finite() {
                            return Err(invalid(t, format!("leaf {i} is not finite")));
                        }
                        Node::Leaf(*leaf)
                    }
                    NodeSpec::Numeric { feature, threshold, left, right } => {
                        check_children(t, i, *left, *right, len)?;
                        Node::Numeric { slot: resolve_numeric(feature)?, threshold: *threshold, left: *left, right: *right }
                    }
                    NodeSpec::Categorical { feature, values, left, right } => {
                        check_children(t, i, *left, *right, len)?;
                        Node::Categorical {
                            slot:   resolve_categorical(feature)?,
                            values: values.iter().cloned().collect(),
                            left:   *left,
                            right:  *right,
                        }
                    }
                });
            }
            trees.push(nodes);
        }
        Ok(Self { base_score: spec.base_score, trees })
    }

    pub fn n_trees(&self) -> usize { self.trees.len() }
}

impl Model for TreeEnsemble {
    fn predict_proba(&self, fv: &FeatureVector) -> Result<f64, ScoringError> {
        let num = fv.numeric();
        let cat = fv.categorical();

        let mut z = self.base_score;
        for tree in &self.trees {
            let mut i = 0;
            loop {
                match tree.get(i) {
                    Some(Node::Leaf(v)) => { z += v; break; }
                    Some(Node::Numeric { slot, threshold, left, right }) => {
                        // NaN goes right
                        i = if num[*slot] <= *threshold { *left } else { *right };
                    }
                    Some(Node::Categorical { slot, values, left, right }) => {
                        i = if values.contains(&cat[*slot]) { *left } else { *right };
                    }
                    None => return Err(ScoringError::ScoringFailure(format!("node {i} out of range"))),
                }
            }
        }
        Ok(sigmoid(z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "base_score": -3.0,
        "trees": [
            { "nodes": [
                { "feature": "amt_vs_user_avg_ratio", "threshold": 5.0, "left": 1, "right": 2 },
                { "leaf": 0.0 },
                { "leaf": 2.0 } ] },
            { "nodes": [
                { "feature": "category", "values": ["shopping_net", "misc_net"], "left": 1, "right": 2 },
                { "leaf": 1.0 },
                { "leaf": -0.5 } ] }
        ]
    }"#;

    fn fv(ratio: f64, category: &str) -> FeatureVector {
        serde_json::from_value(serde_json::json!({
            "amt": 10.0, "age": 40.0, "is_amt_round_number": true, "distance_km": 5.0,
            "city_pop": 100.0, "category": category, "gender": "F", "hour_of_day": 3,
            "day_of_week": 2, "cc_num_count_last_15m": 0, "cc_num_count_last_1h": 0,
            "cc_num_count_last_24h": 0, "time_since_last_card_trans": 60.0,
            "amt_vs_card_avg_ratio": 1.0, "time_since_last_user_trans": 60.0,
            "user_trans_count": 3, "user_avg_amt_so_far": 10.0, "user_max_amt_so_far": 10.0,
            "amt_vs_user_avg_ratio": ratio, "is_over_user_max_amt": false,
            "user_avg_amt_last_5_trans": 10.0, "user_merchant_trans_count": 1,
            "is_new_merchant_for_user": false, "user_avg_amt_category_so_far": 10.0,
            "amt_vs_user_category_avg": 1.0, "is_new_state": false,
            "merchant_avg_amt_so_far": 10.0, "amt_vs_merchant_avg_ratio": 1.0,
            "merchant_card_count": 1, "account_card_count": 1,
            "merchant_encoded": 0.0029, "city_encoded": 0.0029, "state_encoded": 0.0029,
            "acct_num_encoded": 0.0029, "ssn_encoded": 0.0029
        }))
        .unwrap()
    }

    fn ensemble() -> TreeEnsemble {
        TreeEnsemble::compile(&serde_json::from_str(SPEC).unwrap()).unwrap()
    }

    #[test]
    fn walks_numeric_and_categorical_splits() {
        let m = ensemble();
        assert_eq!(m.n_trees(), 2);
        assert!((m.predict_proba(&fv(1.0, "shopping_net")).unwrap() - sigmoid(-2.0)).abs() < 1e-12);
        assert!((m.predict_proba(&fv(9.0, "shopping_net")).unwrap() - sigmoid(0.0)).abs() < 1e-12);
        assert!((m.predict_proba(&fv(9.0, "grocery_pos")).unwrap() - sigmoid(-1.5)).abs() < 1e-12);
    }

    #[test]
    fn nan_feature_takes_right_branch() {
        let mut v = fv(1.0, "grocery_pos");
        v.amt_vs_user_avg_ratio = f64::NAN;
        let p = ensemble().predict_proba(&v).unwrap();
        assert!((p - sigmoid(-1.5)).abs() < 1e-12);
    }

    #[test]
    fn backward_edges_are_rejected() {
        let cyclic = r#"{ "trees": [ { "nodes": [
            { "feature": "amt", "threshold": 1.0, "left": 0, "right": 1 },
            { "leaf": 0.0 } ] } ] }"#;
        let spec: TreeEnsembleSpec = serde_json::from_str(cyclic).unwrap();
        assert!(matches!(TreeEnsemble::compile(&spec), Err(ScoringError::InvalidArtifact(_))));
    }

    #[test]
    fn unknown_split_feature_is_rejected() {
        let bad = SPEC.replace("\"category\"", "\"merchant_category\"");
        let spec: TreeEnsembleSpec = serde_json::from_str(&bad).unwrap();
        assert!(TreeEnsemble::compile(&spec).is_err());
    }
}
