// fraudwatch/src/sinks.rs
//
// Persistence of processed transactions. At-most-once: a failed write is
// logged by the pipeline and never retried.
//
//   JsonlSink   - append one ProcessedRecord per line
//   SqliteSink  - `transactions` table (schema in state::sqlite)
//   NullSink    - persistence disabled

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::params;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{PersistConfig, PersistKind};
use crate::events::ProcessedRecord;
use crate::state::sqlite::SqlitePool;

#[async_trait]
pub trait TransactionSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn persist(&self, record: &ProcessedRecord) -> Result<()>;
}

// ── JSONL ─────────────────────────────────────────────────────────────────────

pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path { &self.path }
}

#[async_trait]
impl TransactionSink for JsonlSink {
    fn name(&self) -> &'static str { "jsonl" }

    async fn persist(&self, record: &ProcessedRecord) -> Result<()> {
        let line = serde_json::to_string(record)? + "\n";
        let mut f = self.file.lock().await;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }
}

// ── SQLite ────────────────────────────────────────────────────────────────────

pub struct SqliteSink {
    pool: Arc<SqlitePool>,
}

impl SqliteSink {
    pub fn new(pool: Arc<SqlitePool>) -> Self { Self { pool } }
}

#[async_trait]
impl TransactionSink for SqliteSink {
    fn name(&self) -> &'static str { "sqlite" }

    async fn persist(&self, record: &ProcessedRecord) -> Result<()> {
        let doc = serde_json::to_string(record)?;
        let tx  = &record.transaction;
        let d   = &record.decision;
        let row = (
            tx.trans_num.clone(),
            tx.card_id.clone(),
            tx.merchant.clone(),
            tx.amount,
            d.probability,
            d.label.as_flag(),
            d.fail_safe.map(|r| r.to_string()),
            record.processed_at.to_rfc3339(),
        );
        self.pool.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO transactions
                   (trans_num, card_id, merchant, amount, probability, label, fail_safe, doc, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![row.0, row.1, row.2, row.3, row.4, row.5, row.6, doc, row.7],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

// ── Null ──────────────────────────────────────────────────────────────────────

pub struct NullSink;

#[async_trait]
impl TransactionSink for NullSink {
    fn name(&self) -> &'static str { "null" }

    async fn persist(&self, _record: &ProcessedRecord) -> Result<()> { Ok(()) }
}

/// Build the configured sink. `store_db` is the entity-state database path
/// when the store runs on SQLite; the SQLite sink defaults to it.
pub async fn from_config(cfg: &PersistConfig, store_db: Option<&str>) -> Result<Arc<dyn TransactionSink>> {
    let sink: Arc<dyn TransactionSink> = match cfg.kind {
        PersistKind::None => Arc::new(NullSink),
        PersistKind::Jsonl => {
            let path = cfg.path.as_deref().context("persist.path is required for the jsonl sink")?;
            Arc::new(JsonlSink::open(path).await?)
        }
        PersistKind::Sqlite => {
            let path = cfg.path.as_deref()
                .and_then(Path::to_str)
                .or(store_db)
                .context("persist.path is required for the sqlite sink")?;
            Arc::new(SqliteSink::new(SqlitePool::open(path, cfg.pool_size)?))
        }
    };
    info!(sink = sink.name(), "Persistence sink ready");
    Ok(sink)
}
