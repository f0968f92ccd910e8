// fraudwatch/src/main.rs
//
// fraudwatch: real-time transaction fraud scoring
//
// Four source modes:
//   tail    - follow a growing JSONL transaction feed (production file drop)
//   replay  - replay a captured feed at scaled speed (testing/research)
//   batch   - score a file once and exit (backfill)
//   tcp     - newline-delimited JSON push stream, reconnecting with backoff
//
// Usage:
//   fraudwatch --mode tail   --path /var/spool/tx.jsonl --model model.json
//   fraudwatch --mode replay --path captured.jsonl --speed 10.0 --store sqlite:///tmp/fw.db
//   fraudwatch --mode tcp    --addr 10.0.0.5:9400 --config fraudwatch.json

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fraudwatch::config::{AppConfig, NotifyKind, PersistKind, SourceConfig, SourceKind};
use fraudwatch::encoding::TargetEncodings;
use fraudwatch::error::SourceError;
use fraudwatch::metrics::PipelineMetrics;
use fraudwatch::notify::{JsonlTarget, LogTarget, NotificationTarget, Notifier};
use fraudwatch::state::backend;
use fraudwatch::{sinks, source};
use fraudwatch::{Dispatcher, EntityStateStore, FeatureComputer, Pipeline, ScoringEngine, Transaction};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "fraudwatch",
    about   = "Real-time transaction fraud scoring with a stateful per-entity feature store",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, env = "FRAUDWATCH_CONFIG", help = "JSON config file; flags override its values")]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    mode: Option<SourceKind>,

    #[arg(long, help = "JSONL feed path (tail/replay/batch modes)")]
    path: Option<PathBuf>,

    #[arg(long, help = "Replay speed multiplier")]
    speed: Option<f64>,

    #[arg(long, help = "host:port of the push stream (tcp mode)")]
    addr: Option<String>,

    #[arg(long, help = "Tail from the start of the file instead of the end")]
    from_start: bool,

    #[arg(long, env = "FRAUDWATCH_STORE", help = "memory | sqlite://<path>")]
    store: Option<String>,

    #[arg(long, env = "FRAUDWATCH_MODEL", help = "Model artifact (JSON)")]
    model: Option<PathBuf>,

    #[arg(long, help = "Target-encoding table (JSON)")]
    encodings: Option<PathBuf>,

    #[arg(long, help = "Decision threshold; overrides the artifact's")]
    threshold: Option<f64>,

    #[arg(long, help = "Keep running with label 0 for everything if the model cannot load")]
    fail_safe_only: bool,

    #[arg(long, help = "Worker pool size")]
    workers: Option<usize>,

    #[arg(long, help = "Per-event budget for reads + features + scoring (ms)")]
    budget_ms: Option<u64>,

    #[arg(long, value_enum, help = "Processed-transaction sink")]
    persist: Option<PersistKind>,

    #[arg(long, help = "Sink path (jsonl file or sqlite database)")]
    persist_path: Option<PathBuf>,

    #[arg(long, help = "Write {trans_num, flag_value} notifications to this JSONL file")]
    flags_out: Option<PathBuf>,
}

impl Cli {
    /// Defaults ← config file ← flags.
    fn into_config(self) -> Result<AppConfig> {
        let mut cfg = match &self.config {
            Some(p) => AppConfig::load(p)?,
            None    => AppConfig::default(),
        };
        if let Some(m) = self.mode      { cfg.source.kind = m; }
        if let Some(p) = self.path      { cfg.source.path = p; }
        if let Some(s) = self.speed     { cfg.source.speed = s; }
        if let Some(a) = self.addr      { cfg.source.addr = a; }
        if self.from_start              { cfg.source.seek_end = false; }
        if let Some(s) = self.store     { cfg.store.url = s; }
        if let Some(m) = self.model     { cfg.scoring.model_path = Some(m); }
        if let Some(e) = self.encodings { cfg.scoring.encodings_path = Some(e); }
        if let Some(t) = self.threshold { cfg.scoring.threshold = Some(t); }
        if self.fail_safe_only          { cfg.scoring.allow_fail_safe_only = true; }
        if let Some(w) = self.workers   { cfg.pipeline.workers = w; }
        if let Some(b) = self.budget_ms { cfg.pipeline.event_budget_ms = b; }
        if let Some(k) = self.persist   { cfg.persist.kind = k; }
        if let Some(p) = self.persist_path { cfg.persist.path = Some(p); }
        if let Some(f) = self.flags_out {
            cfg.notify.kind = NotifyKind::Jsonl;
            cfg.notify.path = Some(f);
        }
        Ok(cfg)
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner(cfg: &AppConfig) {
    println!("\x1b[1m  fraudwatch\x1b[0m \x1b[90mv{}\x1b[0m", env!("CARGO_PKG_VERSION"));
    println!("  \x1b[90mStateful feature store + concurrent fraud scoring\x1b[0m\n");
    let input = match cfg.source.kind {
        SourceKind::Tcp => cfg.source.addr.clone(),
        _               => cfg.source.path.display().to_string(),
    };
    println!("  Mode   : {:?}  |  {}", cfg.source.kind, input);
    println!("  Store  : {}", cfg.store.url);
    println!("  Workers: {}  budget={}ms\n", cfg.pipeline.workers, cfg.pipeline.event_budget_ms);
}

async fn stats_loop(pipeline: Arc<Pipeline>, start: Instant, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        pipeline.snapshot_stats(start.elapsed()).log();
    }
}

// ── Sources ───────────────────────────────────────────────────────────────────

fn spawn_source(
    cfg:     &SourceConfig,
    tx:      mpsc::Sender<Transaction>,
    metrics: Arc<PipelineMetrics>,
) -> JoinHandle<Result<(), SourceError>> {
    let cfg = cfg.clone();
    tokio::spawn(async move {
        match cfg.kind {
            SourceKind::Tail   => source::tail_jsonl(cfg.path, tx, cfg.seek_end, metrics).await,
            SourceKind::Replay => source::replay_jsonl(cfg.path, tx, cfg.speed, metrics).await,
            SourceKind::Batch  => source::batch_jsonl(cfg.path, tx, metrics).await.map(|_| ()),
            SourceKind::Tcp    => {
                let policy = cfg.reconnect_policy();
                source::tcp_stream(cfg.addr, tx, policy, metrics).await
            }
        }
    })
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("fraudwatch=info".parse()?))
        .compact().init();

    let cfg = Cli::parse().into_config()?;
    cfg.validate().context("invalid configuration")?;
    print_banner(&cfg);
    run(cfg).await
}

async fn run(cfg: AppConfig) -> Result<()> {
    // ── State store ──────────────────────────────────────────────────────────
    let horizons = cfg.windows.horizons();
    let backend  = backend::connect(&cfg.store.url, cfg.store.pool_size)
        .with_context(|| format!("connecting state store {}", cfg.store.url))?;
    let store = Arc::new(EntityStateStore::new(backend, horizons, cfg.store.retry_policy()));
    match store.ping().await {
        Ok(())  => info!(backend = store.backend_name(), "State store reachable"),
        Err(e)  => warn!(backend = store.backend_name(), error = %e,
                         "State store ping failed; reads will fall back to empty history"),
    }

    // ── Model + features ─────────────────────────────────────────────────────
    let scoring = Arc::new(ScoringEngine::from_config(&cfg.scoring).context("loading model artifact")?);
    let encodings = match &cfg.scoring.encodings_path {
        Some(p) => TargetEncodings::load(p)?,
        None    => TargetEncodings::default(),
    };
    let features = FeatureComputer::new(cfg.features.clone(), horizons, Arc::new(encodings));

    // ── Outputs ──────────────────────────────────────────────────────────────
    let target: Arc<dyn NotificationTarget> = match (cfg.notify.kind, &cfg.notify.path) {
        (NotifyKind::Jsonl, Some(p)) => Arc::new(JsonlTarget::open(p).await
            .with_context(|| format!("opening notification file {}", p.display()))?),
        _ => Arc::new(LogTarget),
    };
    let (notifier, notify_task) = Notifier::spawn(target, cfg.notify.queue_capacity);
    let sink = sinks::from_config(&cfg.persist, cfg.store.sqlite_path()).await?;

    // ── Pipeline ─────────────────────────────────────────────────────────────
    let metrics  = Arc::new(PipelineMetrics::new());
    let pipeline = Arc::new(Pipeline::new(
        store, features, scoring, notifier, sink, cfg.pipeline.event_budget(), Arc::clone(&metrics),
    ));

    let start        = Instant::now();
    let (tx, rx)     = mpsc::channel::<Transaction>(cfg.pipeline.queue_capacity);
    let stats_every  = Duration::from_secs(cfg.pipeline.stats_interval_secs.max(1));
    let stats_task   = tokio::spawn(stats_loop(Arc::clone(&pipeline), start, stats_every));
    let mut src_task = spawn_source(&cfg.source, tx, metrics);
    let dispatch     = tokio::spawn(Dispatcher::new(Arc::clone(&pipeline), cfg.pipeline.workers).run(rx));

    println!("  Press Ctrl+C to stop.\n");

    // Either the source finishes (batch end / fatal error) or we are told to
    // stop. Both close the queue; the workers then drain what is left.
    let source_result = tokio::select! {
        _   = tokio::signal::ctrl_c() => {
            info!("Shutdown requested, draining");
            src_task.abort();
            None
        }
        res = &mut src_task => Some(res),
    };

    if let Err(e) = dispatch.await {
        error!(error = %e, "Dispatcher task failed");
    }
    stats_task.abort();
    let _ = stats_task.await;
    pipeline.snapshot_stats(start.elapsed()).log();

    // last pipeline handle owns the notifier; dropping it lets delivery finish
    drop(pipeline);
    if let Err(e) = notify_task.await {
        error!(error = %e, "Notifier task failed");
    }

    match source_result {
        Some(Ok(Err(e))) => Err(e).context("event stream failed"),
        Some(Err(e))     => Err(e).context("event source task failed"),
        _                => Ok(()),
    }
}
