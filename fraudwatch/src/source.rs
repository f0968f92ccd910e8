// fraudwatch/src/source.rs
//
// Inbound transaction streams. Each source splits its input on '\n' as raw
// bytes, drops malformed records (bad UTF-8 or bad JSON; counted + logged,
// never retried) and pushes the rest onto the dispatcher queue in arrival
// order. A source returns once the queue's receiver is gone.
//
//   tail    - follow a growing file
//   replay  - re-emit a captured file paced by its own event timestamps
//   batch   - read a file once, as fast as the queue accepts
//   tcp     - newline-delimited JSON over TCP, reconnecting with backoff

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{EventError, SourceError};
use crate::events::Transaction;
use crate::metrics::PipelineMetrics;

/// Decode one raw line. Blank lines yield nothing; bad ones are counted.
fn decode(raw: &[u8], metrics: &PipelineMetrics) -> Option<Transaction> {
    let parsed = std::str::from_utf8(raw)
        .map_err(|e| EventError::Malformed(format!("invalid utf-8: {e}")))
        .map(str::trim)
        .and_then(|line| if line.is_empty() { Ok(None) } else { Transaction::from_json(line).map(Some) });
    match parsed {
        Ok(t)  => t,
        Err(e) => {
            metrics.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Skipping malformed event");
            None
        }
    }
}

/// Decode one line and enqueue it. Returns false once the queue is closed.
async fn ingest(raw: &[u8], tx: &mpsc::Sender<Transaction>, metrics: &PipelineMetrics) -> bool {
    match decode(raw, metrics) {
        Some(t) => tx.send(t).await.is_ok(),
        None    => true,
    }
}

// ── File sources ──────────────────────────────────────────────────────────────

pub async fn tail_jsonl(
    path:     PathBuf,
    tx:       mpsc::Sender<Transaction>,
    seek_end: bool,
    metrics:  Arc<PipelineMetrics>,
) -> Result<(), SourceError> {
    let file      = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).split(b'\n');

    if seek_end {
        while lines.next_segment().await?.is_some() {}  // consume existing
    }

    info!(path = %path.display(), "Tailing");
    loop {
        match lines.next_segment().await? {
            Some(line) => { if !ingest(&line, &tx, &metrics).await { break; } }
            None       => {
                if tx.is_closed() { break; }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    Ok(())
}

/// Read the whole file once. Returns the number of lines read.
pub async fn batch_jsonl(
    path:    PathBuf,
    tx:      mpsc::Sender<Transaction>,
    metrics: Arc<PipelineMetrics>,
) -> Result<u64, SourceError> {
    let file      = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).split(b'\n');
    let mut n     = 0u64;
    while let Some(line) = lines.next_segment().await? {
        n += 1;
        if !ingest(&line, &tx, &metrics).await { break; }
    }
    info!(path = %path.display(), lines = n, "Batch source finished");
    Ok(n)
}

/// Replay at `speed`× the original inter-arrival gaps. Event timestamps are
/// left untouched so windowed features see the captured timeline.
pub async fn replay_jsonl(
    path:    PathBuf,
    tx:      mpsc::Sender<Transaction>,
    speed:   f64,
    metrics: Arc<PipelineMetrics>,
) -> Result<(), SourceError> {
    let content = tokio::fs::read(&path).await?;
    let mut events: Vec<Transaction> = content
        .split(|b| *b == b'\n')
        .filter_map(|line| decode(line, &metrics))
        .collect();
    let Some(first) = events.iter().map(|t| t.timestamp).min() else { return Ok(()) };
    events.sort_by_key(|t| t.timestamp);

    let speed     = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
    let base_wall = tokio::time::Instant::now();
    info!(path = %path.display(), events = events.len(), speed, "Replaying");

    for event in events {
        let offset = (event.timestamp - first).num_milliseconds().max(0) as f64 / 1000.0 / speed;
        tokio::time::sleep_until(base_wall + Duration::from_secs_f64(offset)).await;
        if tx.send(event).await.is_err() { break; }
    }
    Ok(())
}

// ── TCP source ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base:         Duration,
    pub cap:          Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(250), cap: Duration::from_secs(30), max_attempts: 10 }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `n` (1-based).
    pub fn delay(&self, n: u32) -> Duration {
        let factor = 2u32.saturating_pow(n.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Consume `addr` until the queue closes. Disconnects are retried; after
/// `max_attempts` consecutive failed connects the source gives up.
pub async fn tcp_stream(
    addr:    String,
    tx:      mpsc::Sender<Transaction>,
    policy:  ReconnectPolicy,
    metrics: Arc<PipelineMetrics>,
) -> Result<(), SourceError> {
    let mut failures = 0u32;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                failures = 0;
                info!(addr = %addr, "Stream connected");
                let mut lines = BufReader::new(stream).split(b'\n');
                loop {
                    match lines.next_segment().await {
                        Ok(Some(line)) => { if !ingest(&line, &tx, &metrics).await { return Ok(()); } }
                        Ok(None)       => { warn!(addr = %addr, "Stream closed by peer"); break; }
                        Err(e)         => { warn!(addr = %addr, error = %e, "Stream read failed"); break; }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!(addr = %addr, attempt = failures, error = %e, "Stream connect failed");
                if failures >= policy.max_attempts {
                    return Err(SourceError::Unreachable { addr, attempts: failures });
                }
            }
        }
        if tx.is_closed() { return Ok(()); }
        tokio::time::sleep(policy.delay(failures.max(1))).await;
    }
}
