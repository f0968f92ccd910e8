// fraudwatch/tests/common/mod.rs
//
// Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use fraudwatch::encoding::TargetEncodings;
use fraudwatch::features::FeatureDefaults;
use fraudwatch::metrics::PipelineMetrics;
use fraudwatch::model::ModelArtifact;
use fraudwatch::notify::{LogTarget, NotificationTarget, Notifier};
use fraudwatch::sinks::{NullSink, TransactionSink};
use fraudwatch::state::entity::Horizons;
use fraudwatch::{EntityStateStore, FeatureComputer, Pipeline, ScoringEngine, Transaction};

pub const T0: i64 = 1_700_000_000;

/// Logistic model that leans on the spend ratio and unfamiliar merchants.
pub const LOGISTIC: &str = r#"{
    "name": "lr-it", "version": "3", "threshold": 0.5,
    "model": { "kind": "logistic", "intercept": -3.0,
               "weights": { "amt_vs_user_avg_ratio": 0.8, "is_new_merchant_for_user": 0.6,
                            "cc_num_count_last_1h": 0.3 },
               "categorical": { "category": { "shopping_net": 1.1 } } }
}"#;

/// Always 0.5: intercept 0, nothing else.
pub const COIN: &str = r#"{
    "name": "coin", "version": "1",
    "model": { "kind": "logistic", "intercept": 0.0 }
}"#;

pub fn tx_json(id: &str, card: &str, ssn: &str, merchant: &str, amt: f64, unix: i64) -> String {
    format!(
        r#"{{"trans_num":"{id}","cc_num":"{card}","ssn":"{ssn}","merchant":"{merchant}",
            "category":"grocery_pos","amt":{amt},"state":"NY","unix_time":{unix}}}"#
    )
}

pub fn tx(id: &str, card: &str, ssn: &str, merchant: &str, amt: f64, unix: i64) -> Transaction {
    Transaction::from_json(&tx_json(id, card, ssn, merchant, amt, unix)).unwrap()
}

/// Same record carrying an `acct_num`.
pub fn tx_for_account(id: &str, card: &str, acct: &str, merchant: &str, unix: i64) -> Transaction {
    let json = tx_json(id, card, "555-00-1234", merchant, 25.0, unix)
        .replacen('{', &format!(r#"{{"acct_num":"{acct}","#), 1);
    Transaction::from_json(&json).unwrap()
}

pub fn engine(artifact: &str, threshold: Option<f64>) -> ScoringEngine {
    let model = ModelArtifact::from_json(artifact).unwrap().compile().unwrap();
    ScoringEngine::new(model, threshold)
}

pub fn computer() -> FeatureComputer {
    FeatureComputer::new(FeatureDefaults::default(), Horizons::default(), Arc::new(TargetEncodings::default()))
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub notifier: JoinHandle<()>,
}

pub struct Builder {
    store:   Arc<EntityStateStore>,
    scoring: ScoringEngine,
    sink:    Arc<dyn TransactionSink>,
    target:  Arc<dyn NotificationTarget>,
    budget:  Duration,
}

impl Builder {
    pub fn new(scoring: ScoringEngine) -> Self {
        Self {
            store:   Arc::new(EntityStateStore::in_memory()),
            scoring,
            sink:    Arc::new(NullSink),
            target:  Arc::new(LogTarget),
            budget:  Duration::from_secs(5),
        }
    }

    pub fn store(mut self, store: Arc<EntityStateStore>) -> Self { self.store = store; self }
    pub fn sink(mut self, sink: Arc<dyn TransactionSink>) -> Self { self.sink = sink; self }
    pub fn target(mut self, target: Arc<dyn NotificationTarget>) -> Self { self.target = target; self }
    pub fn budget(mut self, budget: Duration) -> Self { self.budget = budget; self }

    pub fn build(self) -> Harness {
        let (notifier, handle) = Notifier::spawn(self.target, 1024);
        let pipeline = Pipeline::new(
            self.store,
            computer(),
            Arc::new(self.scoring),
            notifier,
            self.sink,
            self.budget,
            Arc::new(PipelineMetrics::new()),
        );
        Harness { pipeline: Arc::new(pipeline), notifier: handle }
    }
}

impl Harness {
    /// Drop the pipeline and wait for queued notifications to land.
    pub async fn shutdown(self) {
        drop(self.pipeline);
        self.notifier.await.unwrap();
    }
}
