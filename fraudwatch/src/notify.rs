// fraudwatch/src/notify.rs
//
// Best-effort decision notifications.
//
// Workers hand a Notification to `Notifier::notify`, which never waits: the
// bounded queue either accepts it or it is dropped and counted. A single
// background task drains the queue into a NotificationTarget. Delivery
// failures are logged and counted, nothing more; the pipeline never sees
// them and notifications may land after the transaction's state commit.
//
// Targets:
//   JsonlTarget - one {"trans_num": .., "flag_value": 0|1} line per decision
//   LogTarget   - tracing only

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NotifyError;
use crate::events::Notification;

#[async_trait]
pub trait NotificationTarget: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError>;

    async fn flush(&self) -> Result<(), NotifyError> { Ok(()) }
}

// ── Targets ───────────────────────────────────────────────────────────────────

pub struct LogTarget;

#[async_trait]
impl NotificationTarget for LogTarget {
    fn name(&self) -> &'static str { "log" }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        if n.flag_value == 1 {
            info!(trans_num = %n.trans_num, flag_value = n.flag_value, "FRAUD flagged");
        } else {
            debug!(trans_num = %n.trans_num, flag_value = n.flag_value, "Transaction cleared");
        }
        Ok(())
    }
}

pub struct JsonlTarget {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTarget {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, NotifyError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path { &self.path }
}

#[async_trait]
impl NotificationTarget for JsonlTarget {
    fn name(&self) -> &'static str { "jsonl" }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        let line = serde_json::to_string(n).map_err(|e| NotifyError::Delivery(e.to_string()))? + "\n";
        self.file.lock().await.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), NotifyError> {
        self.file.lock().await.flush().await?;
        Ok(())
    }
}

// ── Notifier ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct NotifyStats {
    pub enqueued:  AtomicU64,
    pub delivered: AtomicU64,
    pub dropped:   AtomicU64,
    pub failed:    AtomicU64,
}

pub struct Notifier {
    queue:     mpsc::Sender<Notification>,
    pub stats: Arc<NotifyStats>,
}

impl Notifier {
    /// Start the delivery task. It exits after every `Notifier` handle is
    /// dropped and the queue is drained.
    pub fn spawn(target: Arc<dyn NotificationTarget>, capacity: usize) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats    = Arc::new(NotifyStats::default());
        info!(kind = target.name(), capacity, "Notifier started");
        let handle = tokio::spawn(delivery_loop(rx, target, Arc::clone(&stats)));
        (Arc::new(Self { queue: tx, stats }), handle)
    }

    /// Enqueue without waiting. Full or closed queue → dropped.
    pub fn notify(&self, n: Notification) {
        match self.queue.try_send(n) {
            Ok(()) => { self.stats.enqueued.fetch_add(1, Ordering::Relaxed); }
            Err(mpsc::error::TrySendError::Full(n)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(trans_num = %n.trans_num, "Notification queue full, dropped");
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(trans_num = %n.trans_num, "Notifier closed, dropped");
            }
        }
    }
}

async fn delivery_loop(
    mut rx: mpsc::Receiver<Notification>,
    target: Arc<dyn NotificationTarget>,
    stats:  Arc<NotifyStats>,
) {
    while let Some(n) = rx.recv().await {
        match target.deliver(&n).await {
            Ok(())  => { stats.delivered.fetch_add(1, Ordering::Relaxed); }
            Err(e)  => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(trans_num = %n.trans_num, kind = target.name(), error = %e, "Notification failed");
            }
        }
        // flush once the burst is drained
        if rx.is_empty() {
            if let Err(e) = target.flush().await {
                warn!(kind = target.name(), error = %e, "Notification flush failed");
            }
        }
    }
    debug!(kind = target.name(), "Notifier drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl NotificationTarget for Failing {
        fn name(&self) -> &'static str { "failing" }
        async fn deliver(&self, _: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery("endpoint down".into()))
        }
    }

    fn note(id: &str, flag: u8) -> Notification {
        Notification { trans_num: id.into(), flag_value: flag }
    }

    #[tokio::test]
    async fn jsonl_target_writes_one_line_per_notification() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/flags.jsonl");
        let target = Arc::new(JsonlTarget::open(&path).await.unwrap());
        let (notifier, handle) = Notifier::spawn(target, 16);

        notifier.notify(note("a", 0));
        notifier.notify(note("b", 1));
        let stats = Arc::clone(&notifier.stats);
        drop(notifier);
        handle.await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Notification> = body.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines, vec![note("a", 0), note("b", 1)]);
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let (notifier, handle) = Notifier::spawn(Arc::new(Failing), 4);
        notifier.notify(note("x", 1));
        let stats = Arc::clone(&notifier.stats);
        drop(notifier);
        handle.await.unwrap();
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_instead_of_blocking() {
        // current_thread: the delivery task cannot run until we yield
        let (notifier, handle) = Notifier::spawn(Arc::new(LogTarget), 2);
        for i in 0..5 {
            notifier.notify(note(&i.to_string(), 0));
        }
        assert_eq!(notifier.stats.enqueued.load(Ordering::Relaxed), 2);
        assert_eq!(notifier.stats.dropped.load(Ordering::Relaxed), 3);
        drop(notifier);
        handle.await.unwrap();
    }
}
