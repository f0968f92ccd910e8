// fraudwatch/src/state/store.rs
//
// EntityStateStore: the only mutable shared resource in the pipeline.
//
// Concurrency model: one slot per entity key, each guarded by its own async
// mutex (a per-key sequencer). DashMap shard locks are held only long enough
// to find or create the slot, so different keys never contend; every read
// and commit on the same key runs under that key's mutex and is therefore
// linearizable. The durable write happens before the mutex is released, so
// the backend sees a key's documents in commit order too.
//
//   get / snapshot_for  - read under the key lock, never apply the event
//   commit              - fold the event in, write through with retry/backoff

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::{StoreError, StoreResult};
use crate::events::Transaction;
use crate::state::backend::{MemoryBackend, StateBackend};
use crate::state::entity::{EntityKey, EntityState, Horizons};

// ── Retry policy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts:   u32,
    pub base_delay: Duration,
    pub max_delay:  Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts:   4,
            base_delay: Duration::from_millis(20),
            max_delay:  Duration::from_millis(500),
        }
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct StoreStats {
    pub commits:        AtomicU64,
    pub load_failures:  AtomicU64,
    pub save_failures:  AtomicU64,
    pub state_loss:     AtomicU64,
}

/// How far a commit got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Applied in-process and written to the backend.
    Durable,
    /// Applied in-process; the durable write failed after retries.
    MemoryOnly,
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    state: Option<EntityState>,
}

pub struct EntityStateStore {
    slots:     DashMap<EntityKey, Arc<Mutex<Slot>>>,
    backend:   Arc<dyn StateBackend>,
    horizons:  Horizons,
    retry:     RetryPolicy,
    pub stats: StoreStats,
}

impl EntityStateStore {
    pub fn new(backend: Arc<dyn StateBackend>, horizons: Horizons, retry: RetryPolicy) -> Self {
        Self {
            slots: DashMap::new(),
            backend,
            horizons,
            retry,
            stats: StoreStats::default(),
        }
    }

    /// Process-local store with default horizons.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Horizons::default(), RetryPolicy::default())
    }

    pub fn horizons(&self) -> &Horizons { &self.horizons }
    pub fn backend_name(&self) -> &'static str { self.backend.name() }
    pub fn n_entities(&self) -> usize { self.slots.len() }

    pub async fn ping(&self) -> StoreResult<()> { self.backend.ping().await }

    fn slot(&self, key: &EntityKey) -> Arc<Mutex<Slot>> {
        if let Some(s) = self.slots.get(key) {
            return Arc::clone(&s);
        }
        self.slots.entry(key.clone()).or_default().clone()
    }

    /// Current state of `key`, or the empty document if it was never seen.
    pub async fn get(&self, key: &EntityKey) -> StoreResult<EntityState> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        self.load_once(key, &mut slot).await?;
        Ok(slot.state.clone().unwrap_or_else(|| EntityState::empty(key.kind)))
    }

    /// Snapshot of `key` for scoring `tx`: windows are pruned relative to the
    /// event time, and the event itself is not applied.
    pub async fn snapshot_for(&self, key: &EntityKey, tx: &Transaction) -> StoreResult<EntityState> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        self.load_once(key, &mut slot).await?;
        let state = slot.state.get_or_insert_with(|| EntityState::empty(key.kind));
        state.prune(tx.timestamp, &self.horizons);
        Ok(state.clone())
    }

    /// Fold `tx` into `key`'s state and write it through to the backend.
    ///
    /// The in-process copy is always updated once the prior state is known.
    /// A write that still fails after retries is logged as a state-loss
    /// event and reported as `MemoryOnly`; the durable copy lags until the
    /// next successful commit for this key. `Err` means the prior state could
    /// not be loaded and nothing was applied.
    pub async fn commit(&self, key: &EntityKey, tx: &Transaction) -> StoreResult<CommitOutcome> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;

        if slot.state.is_none() {
            let loaded = self.retrying("load", key, || self.backend.load(key)).await;
            let doc = match loaded {
                Ok(doc) => self.check_kind(key, doc),
                Err(StoreError::Corrupt { reason, .. }) => {
                    self.stats.state_loss.fetch_add(1, Ordering::Relaxed);
                    error!(key = %key, reason = %reason, "Corrupt state document, starting fresh");
                    None
                }
                Err(e) => {
                    self.stats.state_loss.fetch_add(1, Ordering::Relaxed);
                    error!(key = %key, trans_num = %tx.trans_num, error = %e,
                           "State lost: could not load prior state for commit");
                    return Err(e);
                }
            };
            slot.state = Some(doc.unwrap_or_else(|| EntityState::empty(key.kind)));
        }

        let state = slot.state.get_or_insert_with(|| EntityState::empty(key.kind));
        state.apply(tx, &self.horizons);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);

        let doc = state.clone();
        if let Err(e) = self.retrying("save", key, || self.backend.save(key, &doc)).await {
            self.stats.save_failures.fetch_add(1, Ordering::Relaxed);
            self.stats.state_loss.fetch_add(1, Ordering::Relaxed);
            error!(key = %key, trans_num = %tx.trans_num, error = %e,
                   "State lost: durable write failed after retries");
            return Ok(CommitOutcome::MemoryOnly);
        }
        Ok(CommitOutcome::Durable)
    }

    /// Lazy first-sighting load. One attempt only: reads sit on the latency
    /// path and the caller falls back to the empty state.
    async fn load_once(&self, key: &EntityKey, slot: &mut Slot) -> StoreResult<()> {
        if slot.state.is_some() {
            return Ok(());
        }
        match self.backend.load(key).await {
            Ok(doc) => {
                slot.state = Some(self.check_kind(key, doc).unwrap_or_else(|| EntityState::empty(key.kind)));
                Ok(())
            }
            Err(e) => {
                self.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn check_kind(&self, key: &EntityKey, doc: Option<EntityState>) -> Option<EntityState> {
        match doc {
            Some(d) if d.kind() != key.kind => {
                self.stats.state_loss.fetch_add(1, Ordering::Relaxed);
                error!(key = %key, found = %d.kind(), "State document has wrong kind, starting fresh");
                None
            }
            other => other,
        }
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, key: &EntityKey, mut f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut delay   = self.retry.base_delay;
        let mut attempt = 1u32;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e @ StoreError::Corrupt { .. }) => return Err(e),
                Err(e) if attempt >= self.retry.attempts => return Err(e),
                Err(e) => {
                    warn!(op, key = %key, attempt, error = %e, "State store call failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay    = (delay * 2).min(self.retry.max_delay);
                    attempt += 1;
                }
            }
        }
    }
}
