// fraudwatch/src/engine/dispatcher.rs
//
// Per-transaction pipeline + the worker pool that drives it.
//
//   Received → FeaturesComputed → Scored → Notified → Persisted → StateCommitted
//
// Reads, feature computation and scoring share one time budget; if it runs
// out the event is labelled fail-safe and carries on. Notification is
// fire-and-forget, persistence is at-most-once, and the state commit always
// runs after scoring so the next event for any of its keys sees this one. Nothing in here returns an error to the worker loop.
//
// Workers pull from one shared queue. Different keys proceed in parallel;
// the same key is serialised inside EntityStateStore.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::engine::scoring::ScoringEngine;
use crate::events::{Decision, FailSafeReason, Notification, ProcessedRecord, Stage, Transaction};
use crate::features::{FeatureComputer, FeatureVector};
use crate::metrics::{PipelineMetrics, StatsSnapshot};
use crate::notify::Notifier;
use crate::sinks::TransactionSink;
use crate::state::entity::{EntityKey, EntityState, TxKeys};
use crate::state::store::{CommitOutcome, EntityStateStore};

/// What happened to one transaction.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub decision:  Decision,
    /// Absent when the budget ran out before features were computed.
    pub features:  Option<FeatureVector>,
    pub stage:     Stage,
    pub persisted: bool,
    /// Every touched entity state was updated (durably or in-process).
    pub committed: bool,
}

pub struct Pipeline {
    store:    Arc<EntityStateStore>,
    features: FeatureComputer,
    scoring:  Arc<ScoringEngine>,
    notifier: Arc<Notifier>,
    sink:     Arc<dyn TransactionSink>,
    budget:   Duration,
    metrics:  Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        store:    Arc<EntityStateStore>,
        features: FeatureComputer,
        scoring:  Arc<ScoringEngine>,
        notifier: Arc<Notifier>,
        sink:     Arc<dyn TransactionSink>,
        budget:   Duration,
        metrics:  Arc<PipelineMetrics>,
    ) -> Self {
        Self { store, features, scoring, notifier, sink, budget, metrics }
    }

    pub fn store(&self) -> &Arc<EntityStateStore> { &self.store }
    pub fn scoring(&self) -> &Arc<ScoringEngine> { &self.scoring }
    pub fn metrics(&self) -> &Arc<PipelineMetrics> { &self.metrics }

    pub async fn process(&self, tx: Transaction) -> Outcome {
        let started = Instant::now();
        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        let keys = EntityKey::for_transaction(&tx);

        // ── Received → FeaturesComputed → Scored (budgeted) ─────────────────
        let (decision, features) = match tokio::time::timeout(self.budget, self.evaluate(&tx, &keys)).await {
            Ok((d, fv)) => (d, Some(fv)),
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(trans_num = %tx.trans_num, budget_ms = self.budget.as_millis() as u64,
                      "Event budget exceeded, using fail-safe label");
                (Decision::fail_safe(FailSafeReason::Timeout), None)
            }
        };
        if !decision.is_fail_safe() {
            self.metrics.record_probability(decision.probability);
        }

        // ── Notified (fire-and-forget) ───────────────────────────────────────
        self.notifier.notify(Notification {
            trans_num:  tx.trans_num.clone(),
            flag_value: decision.label.as_flag(),
        });

        // ── Persisted (at-most-once) ─────────────────────────────────────────
        let record = ProcessedRecord { transaction: tx, decision, processed_at: Utc::now() };
        let persisted = match self.sink.persist(&record).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(trans_num = %record.transaction.trans_num, sink = self.sink.name(), error = %e,
                      "Persist failed");
                false
            }
        };

        // ── StateCommitted ───────────────────────────────────────────────────
        let committed = self.commit(&record.transaction, &keys).await;
        let stage = if committed { Stage::StateCommitted } else { Stage::Persisted };

        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_latency(started.elapsed());
        debug!(trans_num = %record.transaction.trans_num, label = %record.decision.label,
               p = record.decision.probability, ?stage, "Processed");

        Outcome { decision: record.decision, features, stage, persisted, committed }
    }

    async fn evaluate(&self, tx: &Transaction, keys: &TxKeys) -> (Decision, FeatureVector) {
        let (card, user, merchant, account) = tokio::join!(
            self.snapshot(&keys.card, tx),
            self.snapshot(&keys.user, tx),
            self.snapshot(&keys.merchant, tx),
            async {
                match &keys.account {
                    Some(k) => Some(self.snapshot(k, tx).await),
                    None    => None,
                }
            },
        );
        let fv = self.features.compute(
            tx,
            &card.into_card().unwrap_or_default(),
            &user.into_user().unwrap_or_default(),
            &merchant.into_merchant().unwrap_or_default(),
            &account.and_then(EntityState::into_account).unwrap_or_default(),
        );
        (self.scoring.score(&fv), fv)
    }

    /// Snapshot for scoring; an unavailable store degrades to empty history.
    async fn snapshot(&self, key: &EntityKey, tx: &Transaction) -> EntityState {
        match self.store.snapshot_for(key, tx).await {
            Ok(s)  => s,
            Err(e) => {
                self.metrics.store_fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, trans_num = %tx.trans_num, error = %e, "State read failed, using defaults");
                EntityState::empty(key.kind)
            }
        }
    }

    async fn commit(&self, tx: &Transaction, keys: &TxKeys) -> bool {
        let (card, user, merchant, account) = tokio::join!(
            self.store.commit(&keys.card, tx),
            self.store.commit(&keys.user, tx),
            self.store.commit(&keys.merchant, tx),
            async {
                match &keys.account {
                    Some(k) => Some(self.store.commit(k, tx).await),
                    None    => None,
                }
            },
        );
        let results = [Some(card), Some(user), Some(merchant), account];
        let mut applied = true;
        for (key, res) in keys.iter().zip(results.into_iter().flatten()) {
            match res {
                Ok(CommitOutcome::Durable | CommitOutcome::MemoryOnly) => {}
                Err(e) => {
                    applied = false;
                    self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
                    error!(key = %key, trans_num = %tx.trans_num, error = %e, "State commit failed");
                }
            }
        }
        applied
    }

    pub fn snapshot_stats(&self, uptime: Duration) -> StatsSnapshot {
        let m = &self.metrics;
        let s = &self.scoring.stats;
        let n = &self.notifier.stats;
        StatsSnapshot {
            uptime_secs:      uptime.as_secs_f64(),
            received:         m.received.load(Ordering::Relaxed),
            processed:        m.processed.load(Ordering::Relaxed),
            flagged:          s.flagged.load(Ordering::Relaxed),
            malformed:        m.malformed.load(Ordering::Relaxed),
            fail_safe:        s.unavailable.load(Ordering::Relaxed)
                            + s.failures.load(Ordering::Relaxed)
                            + m.timeouts.load(Ordering::Relaxed),
            timeouts:         m.timeouts.load(Ordering::Relaxed),
            store_fallbacks:  m.store_fallbacks.load(Ordering::Relaxed),
            state_loss:       self.store.stats.state_loss.load(Ordering::Relaxed),
            commit_failures:  m.commit_failures.load(Ordering::Relaxed),
            notify_dropped:   n.dropped.load(Ordering::Relaxed),
            notify_failed:    n.failed.load(Ordering::Relaxed),
            persist_failures: m.persist_failures.load(Ordering::Relaxed),
            entities:         self.store.n_entities(),
            mean_latency_ms:  m.mean_latency_ms(),
            max_latency_ms:   m.max_latency_ms(),
        }
    }
}

// ── Worker pool ───────────────────────────────────────────────────────────────

pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    workers:  usize,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, workers: usize) -> Self {
        Self { pipeline, workers: workers.max(1) }
    }

    /// Run `workers` tasks over `rx` until it is closed and drained.
    pub async fn run(self, rx: mpsc::Receiver<Transaction>) {
        let rx = Arc::new(Mutex::new(rx));
        info!(workers = self.workers, "Dispatcher started");

        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                let rx       = Arc::clone(&rx);
                let pipeline = Arc::clone(&self.pipeline);
                tokio::spawn(async move {
                    loop {
                        // lock only for the dequeue so other workers can pull
                        let next = rx.lock().await.recv().await;
                        match next {
                            Some(tx) => { pipeline.process(tx).await; }
                            None     => break,
                        }
                    }
                    debug!(worker = id, "Worker drained");
                })
            })
            .collect();

        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!(processed = self.pipeline.metrics.processed.load(Ordering::Relaxed), "Dispatcher drained");
    }
}
