// fraudwatch/src/state/sqlite.rs
//
// SQLite persistence: a small fixed pool of connections shared by every
// worker, plus the entity-state backend built on it.
//
// Data layout:
//   entity_state(kind, id, doc, updated_at)   - one JSON EntityState per key
//   transactions(trans_num, ..., doc)         - see sinks::SqliteSink
//
// rusqlite is blocking; every call hops onto tokio's blocking pool so a slow
// disk never stalls the async workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::state::backend::StateBackend;
use crate::state::entity::{EntityKey, EntityState};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entity_state (
    kind       TEXT NOT NULL,
    id         TEXT NOT NULL,
    doc        TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (kind, id)
);
CREATE TABLE IF NOT EXISTS transactions (
    trans_num    TEXT PRIMARY KEY,
    card_id      TEXT NOT NULL,
    merchant     TEXT NOT NULL,
    amount       REAL NOT NULL,
    probability  REAL NOT NULL,
    label        INTEGER NOT NULL,
    fail_safe    TEXT,
    doc          TEXT NOT NULL,
    processed_at TEXT NOT NULL
);
";

// ── Pool ──────────────────────────────────────────────────────────────────────

pub struct SqlitePool {
    conns: Vec<Mutex<Connection>>,
    next:  AtomicUsize,
    path:  String,
}

impl SqlitePool {
    /// Open `size` connections to the database at `path` and apply the schema.
    pub fn open(path: &str, size: usize) -> StoreResult<Arc<Self>> {
        let size = size.max(1);
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open(path)?;
            // WAL: readers don't block the writer
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
            )?;
            conns.push(Mutex::new(conn));
        }
        if let Some(first) = conns.first() {
            first.lock().execute_batch(SCHEMA)?;
        }
        info!(path, size, "SQLite pool opened");
        Ok(Arc::new(Self { conns, next: AtomicUsize::new(0), path: path.to_string() }))
    }

    /// Single-connection in-memory database (tests).
    pub fn in_memory() -> StoreResult<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Arc::new(Self {
            conns: vec![Mutex::new(conn)],
            next:  AtomicUsize::new(0),
            path:  ":memory:".to_string(),
        }))
    }

    pub fn path(&self) -> &str { &self.path }
    pub fn size(&self) -> usize { self.conns.len() }

    /// Run `f` on a pooled connection from the blocking thread pool.
    /// Prefers an idle connection; waits on the round-robin pick otherwise.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let n     = pool.conns.len();
            let start = pool.next.fetch_add(1, Ordering::Relaxed) % n;
            let conn  = (0..n)
                .find_map(|i| pool.conns[(start + i) % n].try_lock())
                .unwrap_or_else(|| pool.conns[start].lock());
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite task aborted: {e}")))?
    }
}

// ── Entity-state backend ──────────────────────────────────────────────────────

pub struct SqliteBackend {
    pool: Arc<SqlitePool>,
}

impl SqliteBackend {
    pub fn new(pool: Arc<SqlitePool>) -> StoreResult<Self> {
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Arc<SqlitePool> { &self.pool }
}

#[async_trait]
impl StateBackend for SqliteBackend {
    fn name(&self) -> &'static str { "sqlite" }

    async fn load(&self, key: &EntityKey) -> StoreResult<Option<EntityState>> {
        let key = key.clone();
        self.pool.run(move |conn| {
            let doc: Option<String> = conn
                .query_row(
                    "SELECT doc FROM entity_state WHERE kind = ?1 AND id = ?2",
                    params![key.kind.to_string(), key.id],
                    |row| row.get(0),
                )
                .optional()?;
            doc.map(|d| {
                serde_json::from_str::<EntityState>(&d).map_err(|e| StoreError::Corrupt {
                    key:    key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
        })
        .await
    }

    async fn save(&self, key: &EntityKey, state: &EntityState) -> StoreResult<()> {
        let doc = serde_json::to_string(state).map_err(|e| StoreError::Corrupt {
            key:    key.to_string(),
            reason: e.to_string(),
        })?;
        let key = key.clone();
        self.pool.run(move |conn| {
            conn.execute(
                "INSERT INTO entity_state (kind, id, doc, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
                params![key.kind.to_string(), key.id, doc, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.pool.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
