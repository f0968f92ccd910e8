// fraudwatch/tests/pipeline.rs
//
// End-to-end behaviour of Pipeline::process and the Dispatcher.

mod common;

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use fraudwatch::error::{StoreError, StoreResult};
use fraudwatch::events::{FailSafeReason, Notification, ProcessedRecord, Stage};
use fraudwatch::notify::JsonlTarget;
use fraudwatch::sinks::JsonlSink;
use fraudwatch::source;
use fraudwatch::state::backend::{MemoryBackend, StateBackend};
use fraudwatch::state::entity::{EntityKey, EntityState, Horizons};
use fraudwatch::state::store::RetryPolicy;
use fraudwatch::{Dispatcher, EntityStateStore, Label, ScoringEngine};

use common::*;

#[tokio::test]
async fn first_purchase_of_a_new_user_is_neutral() {
    let h = Builder::new(engine(LOGISTIC, None)).build();
    let out = h.pipeline.process(tx("t-1", "4000111122223333", "111-22-3333", "fraud_Kub PLC", 50.0, T0)).await;

    let fv = out.features.as_ref().expect("features computed within budget");
    assert_eq!(fv.user_trans_count, 0);
    assert_eq!(fv.amt_vs_user_avg_ratio, 1.0);
    assert_eq!(fv.user_avg_amt_so_far, 50.0);
    assert!(fv.is_new_merchant_for_user);
    assert_eq!(fv.cc_num_count_last_1h, 0);

    // the pipeline's decision is the scorer's verdict on the same vector
    assert_eq!(out.decision, h.pipeline.scoring().score(fv));
    assert_eq!(out.stage, Stage::StateCommitted);
    assert!(out.committed);
    h.shutdown().await;
}

#[tokio::test]
async fn card_velocity_counts_prior_events_in_window() {
    let h = Builder::new(engine(LOGISTIC, None)).build();
    let mut last = None;
    for i in 0..5 {
        let t = tx(&format!("v-{i}"), "4000999988887777", "222-33-4444", "fraud_Lind", 12.0, T0 + i * 120);
        last = Some(h.pipeline.process(t).await);
    }
    let fv = last.unwrap().features.unwrap();
    assert_eq!(fv.cc_num_count_last_1h, 4);
    assert_eq!(fv.cc_num_count_last_24h, 4);
    assert_eq!(fv.time_since_last_card_trans, 120.0);
    assert_eq!(fv.user_trans_count, 4);
    assert_eq!(fv.user_merchant_trans_count, 4);
    assert!(!fv.is_new_merchant_for_user);
    h.shutdown().await;
}

#[tokio::test]
async fn history_shapes_later_features() {
    let h = Builder::new(engine(LOGISTIC, None)).build();
    for (i, amt) in [10.0, 20.0, 30.0].into_iter().enumerate() {
        h.pipeline.process(tx(&format!("h-{i}"), "c", "u", "m", amt, T0 + i as i64 * 60)).await;
    }
    let out = h.pipeline.process(tx("h-3", "c", "u", "m", 100.0, T0 + 600)).await;
    let fv  = out.features.unwrap();
    assert_eq!(fv.user_avg_amt_so_far, 20.0);
    assert_eq!(fv.user_max_amt_so_far, 30.0);
    assert_eq!(fv.amt_vs_user_avg_ratio, 5.0);
    assert!(fv.is_over_user_max_amt);
    assert_eq!(fv.merchant_avg_amt_so_far, 20.0);
    h.shutdown().await;
}

#[tokio::test]
async fn account_and_merchant_card_spread() {
    let backend = Arc::new(MemoryBackend::new());
    let store   = Arc::new(EntityStateStore::new(
        Arc::clone(&backend) as _, Horizons::default(), RetryPolicy::default(),
    ));
    let h = Builder::new(engine(LOGISTIC, None)).store(Arc::clone(&store)).build();

    for (i, card) in ["c-1", "c-2", "c-1"].into_iter().enumerate() {
        h.pipeline.process(tx_for_account(&format!("a-{i}"), card, "acct-7", "fraud_Spread", T0 + i as i64 * 60)).await;
    }
    let out = h.pipeline.process(tx_for_account("a-3", "c-3", "acct-7", "fraud_Spread", T0 + 300)).await;
    let fv  = out.features.unwrap();
    assert_eq!(fv.account_card_count, 3);
    assert_eq!(fv.merchant_card_count, 3);
    assert_eq!(fv.cc_num_count_last_15m, 0);
    assert!(out.committed);

    let account = store.get(&EntityKey::account("acct-7")).await.unwrap().into_account().unwrap();
    assert_eq!(account.cards.distinct(), 3);
    assert_eq!(account.cards.get("c-1"), 2);

    // card x3, user, merchant, account
    assert_eq!(backend.len(), 6);

    // records without an acct_num never touch an account document
    let out = h.pipeline.process(tx("a-4", "c-1", "555-00-1234", "fraud_Spread", 25.0, T0 + 400)).await;
    let fv  = out.features.unwrap();
    assert_eq!(fv.account_card_count, 1);
    assert_eq!(fv.cc_num_count_last_15m, 2);
    assert_eq!(fv.amt_vs_card_avg_ratio, 1.0);
    assert_eq!(backend.len(), 6);
    h.shutdown().await;
}

#[tokio::test]
async fn model_unavailable_labels_everything_legit_and_still_commits() {
    let store = Arc::new(EntityStateStore::in_memory());
    let h = Builder::new(ScoringEngine::fail_safe_only(0.5)).store(Arc::clone(&store)).build();

    for (i, amt) in [10.0, 20.0, 30.0].into_iter().enumerate() {
        let out = h.pipeline.process(tx(&format!("f-{i}"), "c1", "u1", "m1", amt, T0 + i as i64)).await;
        assert_eq!(out.decision.label, Label::Legit);
        assert_eq!(out.decision.fail_safe, Some(FailSafeReason::ModelUnavailable));
        assert_eq!(out.stage, Stage::StateCommitted);
    }

    let user = store.get(&EntityKey::user("u1")).await.unwrap().into_user().unwrap();
    assert_eq!(user.amounts.count, 3);
    assert_eq!(user.amounts.mean(), Some(20.0));
    assert_eq!(h.pipeline.scoring().stats.unavailable.load(Ordering::Relaxed), 3);
    h.shutdown().await;
}

#[tokio::test]
async fn probability_equal_to_threshold_is_flagged() {
    let dir  = tempfile::tempdir().unwrap();
    let path = dir.path().join("flags.jsonl");
    let target = Arc::new(JsonlTarget::open(&path).await.unwrap());

    let h = Builder::new(engine(COIN, Some(0.5))).target(target).build();
    let out = h.pipeline.process(tx("b-1", "c", "u", "m", 5.0, T0)).await;
    assert_eq!(out.decision.probability, 0.5);
    assert_eq!(out.decision.label, Label::Fraud);
    h.shutdown().await;

    let raw = std::fs::read_to_string(&path).unwrap();
    let n: Notification = serde_json::from_str(raw.trim()).unwrap();
    assert_eq!(n, Notification { trans_num: "b-1".into(), flag_value: 1 });

    let h = Builder::new(engine(COIN, Some(0.5000001))).build();
    let out = h.pipeline.process(tx("b-2", "c", "u", "m", 5.0, T0)).await;
    assert_eq!(out.decision.label, Label::Legit);
    h.shutdown().await;
}

// ── Degraded store ────────────────────────────────────────────────────────────

/// Fails the first `fail_loads` loads, optionally sleeping on every load.
struct Degraded {
    inner:      MemoryBackend,
    fail_loads: u32,
    delay:      Duration,
    loads:      AtomicU32,
}

impl Degraded {
    fn new(fail_loads: u32, delay: Duration) -> Self {
        Self { inner: MemoryBackend::new(), fail_loads, delay, loads: AtomicU32::new(0) }
    }
}

#[async_trait]
impl StateBackend for Degraded {
    fn name(&self) -> &'static str { "degraded" }

    async fn load(&self, key: &EntityKey) -> StoreResult<Option<EntityState>> {
        tokio::time::sleep(self.delay).await;
        if self.loads.fetch_add(1, Ordering::SeqCst) < self.fail_loads {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.load(key).await
    }

    async fn save(&self, key: &EntityKey, state: &EntityState) -> StoreResult<()> {
        self.inner.save(key, state).await
    }

    async fn ping(&self) -> StoreResult<()> { Ok(()) }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy { attempts: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(4) }
}

#[tokio::test]
async fn unreadable_store_falls_back_to_defaults() {
    let backend = Arc::new(Degraded::new(3, Duration::ZERO));
    let store   = Arc::new(EntityStateStore::new(backend, Horizons::default(), fast_retry()));
    let h = Builder::new(engine(LOGISTIC, None)).store(Arc::clone(&store)).build();

    let out = h.pipeline.process(tx("d-1", "c", "u", "m", 42.0, T0)).await;
    let fv  = out.features.unwrap();
    assert_eq!(fv.user_trans_count, 0);
    assert_eq!(fv.amt_vs_user_avg_ratio, 1.0);
    assert!(!out.decision.is_fail_safe());
    assert!(out.committed);
    assert_eq!(h.pipeline.metrics().store_fallbacks.load(Ordering::Relaxed), 3);

    let card = store.get(&EntityKey::card("c")).await.unwrap().into_card().unwrap();
    assert_eq!(card.long_window.len(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn slow_reads_hit_the_budget_but_the_event_still_commits() {
    let backend = Arc::new(Degraded::new(0, Duration::from_millis(200)));
    let store   = Arc::new(EntityStateStore::new(backend, Horizons::default(), fast_retry()));
    let h = Builder::new(engine(LOGISTIC, None))
        .store(Arc::clone(&store))
        .budget(Duration::from_millis(20))
        .build();

    let out = h.pipeline.process(tx("s-1", "c", "u", "m", 9.0, T0)).await;
    assert_eq!(out.decision.fail_safe, Some(FailSafeReason::Timeout));
    assert_eq!(out.decision.label, Label::Legit);
    assert!(out.features.is_none());
    assert_eq!(out.stage, Stage::StateCommitted);
    assert_eq!(h.pipeline.metrics().timeouts.load(Ordering::Relaxed), 1);

    let user = store.get(&EntityKey::user("u")).await.unwrap().into_user().unwrap();
    assert_eq!(user.count(), 1);
    h.shutdown().await;
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_file_runs_through_the_worker_pool() {
    let dir = tempfile::tempdir().unwrap();
    let feed = dir.path().join("feed.jsonl");
    let out  = dir.path().join("processed.jsonl");
    {
        let mut f = std::fs::File::create(&feed).unwrap();
        for i in 0..40 {
            let card = format!("card-{}", i % 4);
            writeln!(f, "{}", tx_json(&format!("t-{i}"), &card, "u-1", "m-1", 10.0 + i as f64, T0 + i)
                .replace('\n', "")).unwrap();
        }
        writeln!(f, "{{\"trans_num\": \"broken\"").unwrap();
    }

    let store = Arc::new(EntityStateStore::in_memory());
    let sink  = Arc::new(JsonlSink::open(&out).await.unwrap());
    let h = Builder::new(engine(LOGISTIC, None)).store(Arc::clone(&store)).sink(sink).build();

    let (tx, rx) = mpsc::channel(8);
    let metrics  = Arc::clone(h.pipeline.metrics());
    let src = tokio::spawn(source::batch_jsonl(feed, tx, Arc::clone(&metrics)));
    Dispatcher::new(Arc::clone(&h.pipeline), 6).run(rx).await;
    assert_eq!(src.await.unwrap().unwrap(), 41);

    assert_eq!(metrics.processed.load(Ordering::Relaxed), 40);
    assert_eq!(metrics.malformed.load(Ordering::Relaxed), 1);

    let user = store.get(&EntityKey::user("u-1")).await.unwrap().into_user().unwrap();
    assert_eq!(user.count(), 40);
    for c in 0..4 {
        let card = store.get(&EntityKey::card(&format!("card-{c}"))).await.unwrap().into_card().unwrap();
        assert_eq!(card.long_window.len(), 10);
    }

    let records: Vec<ProcessedRecord> = std::fs::read_to_string(&out).unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 40);
    assert!(records.iter().all(|r| r.decision.fail_safe.is_none()));
    h.shutdown().await;
}
