use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beskar7_domain::ObjectKey;
use beskar7_metrics::Metrics;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ReconcileError;

/// What a reconcile round wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Done until something changes (or the next resync).
    No,
    /// Run this key again after the given delay.
    After(Duration),
}

/// A synchronous-per-key reconcile function plus the key enumeration the
/// resync loop uses.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: ObjectKey) -> Result<Requeue, ReconcileError>;

    /// Keys of every resource this controller owns, for periodic resync.
    async fn list_keys(&self) -> Result<Vec<ObjectKey>, ReconcileError>;
}

/// Minimal controller runtime: a key-deduplicating work queue feeding a
/// bounded worker pool, plus periodic resync.
///
/// A key is in the channel at most once, so no resource is reconciled by two
/// workers simultaneously; distinct keys proceed in parallel up to
/// `workers`.
pub struct ControllerRunner {
    reconciler: Arc<dyn Reconciler>,
    metrics: Arc<Metrics>,
    workers: usize,
    resync_interval: Duration,
    error_requeue: Duration,
    queued: Arc<Mutex<HashSet<ObjectKey>>>,
    tx: mpsc::UnboundedSender<ObjectKey>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ObjectKey>>>,
}

impl ControllerRunner {
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        workers: usize,
        resync_interval: Duration,
        error_requeue: Duration,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(ControllerRunner {
            reconciler,
            metrics,
            workers: workers.max(1),
            resync_interval,
            error_requeue,
            queued: Arc::new(Mutex::new(HashSet::new())),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Ask for `key` to be reconciled soon. Duplicate requests for a key
    /// already waiting are dropped.
    pub async fn enqueue(&self, key: ObjectKey) {
        let mut queued = self.queued.lock().await;
        if queued.insert(key.clone()) {
            let _ = self.tx.send(key);
        }
    }

    /// Run resync + workers until shutdown. The receiver half can only be
    /// taken once; a second `run` call is a no-op.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let Some(rx) = self.rx.lock().await.take() else {
            warn!(controller = self.reconciler.name(), "runner already started");
            return;
        };
        let rx = Arc::new(Mutex::new(rx));

        let mut tasks = Vec::new();
        for _ in 0..self.workers {
            let runner = self.clone();
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(runner.worker(rx, shutdown)));
        }

        // Resync loop doubles as the initial population pass.
        let mut shutdown_resync = shutdown.clone();
        let resync = {
            let runner = self.clone();
            tokio::spawn(async move {
                loop {
                    match runner.reconciler.list_keys().await {
                        Ok(keys) => {
                            for key in keys {
                                runner.enqueue(key).await;
                            }
                        }
                        Err(e) => {
                            warn!(controller = runner.reconciler.name(), error = %e, "resync list failed")
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(runner.resync_interval) => {}
                        _ = shutdown_resync.changed() => return,
                    }
                }
            })
        };

        for task in tasks {
            let _ = task.await;
        }
        resync.abort();
    }

    async fn worker(
        self: Arc<Self>,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<ObjectKey>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let key = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    key = rx.recv() => match key {
                        Some(key) => key,
                        None => return,
                    },
                    _ = shutdown.changed() => return,
                }
            };

            let started = Instant::now();
            let name = self.reconciler.name();
            let result = self.reconciler.reconcile(key.clone()).await;
            self.metrics
                .reconcile_duration
                .with_label_values(&[name])
                .observe(started.elapsed().as_secs_f64());
            self.queued.lock().await.remove(&key);

            match result {
                Ok(Requeue::No) => {
                    self.metrics
                        .reconcile_total
                        .with_label_values(&[name, "success"])
                        .inc();
                }
                Ok(Requeue::After(delay)) => {
                    self.metrics
                        .reconcile_total
                        .with_label_values(&[name, "requeue"])
                        .inc();
                    debug!(controller = name, key = %key, delay = ?delay, "requeue");
                    Self::schedule(&self, key, delay);
                }
                Err(e) => {
                    self.metrics
                        .reconcile_total
                        .with_label_values(&[name, "error"])
                        .inc();
                    self.metrics
                        .errors_total
                        .with_label_values(&[&e.kind().to_string()])
                        .inc();
                    warn!(controller = name, key = %key, error = %e, "reconcile failed");
                    Self::schedule(&self, key, self.error_requeue);
                }
            }
        }
    }

    fn schedule(runner: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let runner = runner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            runner.enqueue(key).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct Counting {
        keys: Vec<ObjectKey>,
        rounds: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        seen: StdMutex<Vec<ObjectKey>>,
    }

    #[async_trait]
    impl Reconciler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self, key: ObjectKey) -> Result<Requeue, ReconcileError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.rounds.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(key);
            Ok(Requeue::No)
        }

        async fn list_keys(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
            Ok(self.keys.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resync_reconciles_every_key_once() {
        let reconciler = Arc::new(Counting {
            keys: (0..5).map(|i| ObjectKey::new("ns1", format!("h{i}"))).collect(),
            rounds: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            seen: StdMutex::new(Vec::new()),
        });
        let runner = ControllerRunner::new(
            reconciler.clone(),
            4,
            Duration::from_secs(3600),
            Duration::from_secs(300),
            Arc::new(Metrics::new()),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.clone().run(rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(reconciler.rounds.load(Ordering::SeqCst), 5);
        assert!(reconciler.max_concurrent.load(Ordering::SeqCst) <= 4);

        tx.send(true).unwrap();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_enqueues_collapse() {
        let reconciler = Arc::new(Counting {
            keys: vec![],
            rounds: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            seen: StdMutex::new(Vec::new()),
        });
        let runner = ControllerRunner::new(
            reconciler.clone(),
            2,
            Duration::from_secs(3600),
            Duration::from_secs(300),
            Arc::new(Metrics::new()),
        );

        // Enqueue the same key many times before any worker runs.
        for _ in 0..10 {
            runner.enqueue(ObjectKey::new("ns1", "h1")).await;
        }
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(runner.clone().run(rx));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(reconciler.rounds.load(Ordering::SeqCst), 1);
        tx.send(true).unwrap();
        let _ = handle.await;
    }
}
