// fraudwatch/src/state/backend.rs
//
// Durable home of entity documents.
//
// The store keeps a hot in-process copy of every key it has touched and
// writes through to a backend after each commit; the backend is read only
// on the first sighting of a key in this process (cold start / restart).
//
// Backends:
//   memory            - DashMap, process lifetime only (tests, dry runs)
//   sqlite://<path>   - pooled rusqlite connections, one JSON doc per key
//
// A backend that cannot complete a call returns StoreError::Unavailable;
// retry and fallback policy belong to the store and the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{StoreError, StoreResult};
use crate::state::entity::{EntityKey, EntityState};
use crate::state::sqlite::{SqliteBackend, SqlitePool};

#[async_trait]
pub trait StateBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn load(&self, key: &EntityKey) -> StoreResult<Option<EntityState>>;

    async fn save(&self, key: &EntityKey, state: &EntityState) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;
}

// ── In-memory backend ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBackend {
    docs: DashMap<EntityKey, EntityState>,
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.docs.len() }
    pub fn is_empty(&self) -> bool { self.docs.is_empty() }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn name(&self) -> &'static str { "memory" }

    async fn load(&self, key: &EntityKey) -> StoreResult<Option<EntityState>> {
        Ok(self.docs.get(key).map(|d| d.clone()))
    }

    async fn save(&self, key: &EntityKey, state: &EntityState) -> StoreResult<()> {
        self.docs.insert(key.clone(), state.clone());
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> { Ok(()) }
}

// ── Connection strings ────────────────────────────────────────────────────────

/// Build a backend from `memory` or `sqlite://<path>`.
pub fn connect(url: &str, pool_size: usize) -> StoreResult<Arc<dyn StateBackend>> {
    let url = url.trim();
    if url.is_empty() || url == "memory" || url == "memory://" {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        let pool = SqlitePool::open(path, pool_size)?;
        return Ok(Arc::new(SqliteBackend::new(pool)?));
    }
    Err(StoreError::Unavailable(format!("unsupported store url {url:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::entity::EntityKind;

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let b = MemoryBackend::new();
        let k = EntityKey::merchant("acme");
        assert_eq!(b.load(&k).await.unwrap(), None);
        b.save(&k, &EntityState::empty(EntityKind::Merchant)).await.unwrap();
        assert!(b.load(&k).await.unwrap().is_some());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn connect_parses_urls() {
        assert_eq!(connect("memory", 1).unwrap().name(), "memory");
        assert!(connect("mongodb://localhost", 1).is_err());
    }
}
