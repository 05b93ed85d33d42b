use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beskar7_config::QueueSettings;
use beskar7_domain::ObjectKey;
use beskar7_metrics::Metrics;
use beskar7_redfish::RedfishError;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Buckets untouched this long are evicted to bound memory.
const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(60 * 60);

/// Re-enqueue backoff after a retryable worker failure.
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Provision,
    Deprovision,
    PowerOp,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Provision => "provision",
            OperationKind::Deprovision => "deprovision",
            OperationKind::PowerOp => "power",
        };
        write!(f, "{}", s)
    }
}

/// One unit of Redfish work against a single BMC.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub host_key: ObjectKey,
    pub bmc_address: String,
    pub kind: OperationKind,
    /// Higher dispatches first; ties drain FIFO.
    pub priority: i32,
    pub attempt: u32,
}

impl QueueEntry {
    pub fn new(host_key: ObjectKey, bmc_address: impl Into<String>, kind: OperationKind) -> Self {
        QueueEntry {
            host_key,
            bmc_address: bmc_address.into(),
            kind,
            priority: 0,
            attempt: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Same host and operation kind already pending.
    Duplicate,
    /// `max_queue_depth` reached; nothing was recorded.
    QueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub processing: usize,
}

/// Executes dispatched entries. Implemented by the host controller against
/// the Redfish client; tests plug in recorders.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, entry: &QueueEntry) -> Result<(), RedfishError>;

    /// Terminal failure: non-retryable error, or the retry budget is spent.
    /// Implementations park the host in `Error` and surface the reason.
    async fn failed(&self, entry: &QueueEntry, error: &RedfishError);
}

/// Ordering key in the pending set: priority descending, then arrival order.
type PendingKey = (Reverse<i32>, u64);

struct Pending {
    entry: QueueEntry,
    /// Earliest dispatch time; set by retry backoff.
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct BmcBucket {
    last_dispatch_at: Option<Instant>,
    in_flight: usize,
    last_used: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    pending: BTreeMap<PendingKey, Pending>,
    /// Duplicate-suppression index over pending entries.
    index: HashMap<(ObjectKey, OperationKind), PendingKey>,
    buckets: HashMap<String, BmcBucket>,
    in_flight_global: usize,
    seq: u64,
}

/// Bounded, priority-ordered dispatch queue with per-BMC cooldown and
/// concurrency caps.
///
/// All bookkeeping lives under one mutex; nothing holds it across I/O.
/// Deferred entries never block later candidates: the dispatcher scans past
/// them in priority order.
pub struct ProvisioningQueue {
    config: QueueSettings,
    metrics: Arc<Metrics>,
    inner: Mutex<Inner>,
    wake: Notify,
}

impl ProvisioningQueue {
    pub fn new(config: QueueSettings, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(ProvisioningQueue {
            config,
            metrics,
            inner: Mutex::new(Inner::default()),
            wake: Notify::new(),
        })
    }

    pub fn enqueue(&self, entry: QueueEntry) -> EnqueueOutcome {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending.len() >= self.config.max_queue_depth {
                return EnqueueOutcome::QueueFull;
            }
            let index_key = (entry.host_key.clone(), entry.kind);
            if inner.index.contains_key(&index_key) {
                return EnqueueOutcome::Duplicate;
            }
            inner.seq += 1;
            let key = (Reverse(entry.priority), inner.seq);
            inner.index.insert(index_key, key);
            inner.pending.insert(key, Pending { entry, not_before: None });
            self.metrics
                .queue_stats
                .with_label_values(&["depth"])
                .set(inner.pending.len() as i64);
            EnqueueOutcome::Queued
        };
        self.wake.notify_one();
        outcome
    }

    /// Remove every pending entry for `host_key`. In-flight work is not
    /// interrupted. Returns how many entries were dropped.
    pub fn cancel(&self, host_key: &ObjectKey) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<PendingKey> = inner
            .index
            .iter()
            .filter(|((key, _), _)| key == host_key)
            .map(|(_, pk)| *pk)
            .collect();
        for pk in &keys {
            inner.pending.remove(pk);
        }
        inner.index.retain(|(key, _), _| key != host_key);
        self.metrics
            .queue_stats
            .with_label_values(&["depth"])
            .set(inner.pending.len() as i64);
        keys.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats { depth: inner.pending.len(), processing: inner.in_flight_global }
    }

    /// Buckets currently tracked; exposed for eviction tests.
    pub fn bucket_count(&self) -> usize {
        self.inner.lock().unwrap().buckets.len()
    }

    /// Dispatch loop. Runs until `shutdown` flips, then stops handing out
    /// work; in-flight entries finish on their own (see [`Self::drain`]).
    pub async fn run(self: Arc<Self>, runner: Arc<dyn JobRunner>, mut shutdown: watch::Receiver<bool>) {
        info!(
            global = self.config.max_concurrent_global,
            per_bmc = self.config.max_concurrent_per_bmc,
            cooldown = ?self.config.bmc_cooldown,
            "provisioning queue dispatcher started"
        );
        loop {
            let next_wake = Self::dispatch_ready(&self, &runner);
            let sleep_for = next_wake.unwrap_or(Duration::from_secs(60));
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {
                    info!("provisioning queue dispatcher stopping");
                    return;
                }
            }
        }
    }

    /// Dispatch everything currently dispatchable. Returns how long until
    /// the earliest deferred entry could become dispatchable, if any.
    fn dispatch_ready(queue: &Arc<Self>, runner: &Arc<dyn JobRunner>) -> Option<Duration> {
        let mut next_wake: Option<Instant> = None;
        loop {
            let now = Instant::now();
            let dispatched = {
                let mut inner = queue.inner.lock().unwrap();
                queue.evict_idle_buckets(&mut inner, now);

                if inner.in_flight_global >= queue.config.max_concurrent_global {
                    None
                } else {
                    let mut chosen: Option<PendingKey> = None;
                    for (key, pending) in inner.pending.iter() {
                        if let Some(not_before) = pending.not_before {
                            if not_before > now {
                                next_wake = min_instant(next_wake, not_before);
                                continue;
                            }
                        }
                        let bucket = inner.buckets.get(&pending.entry.bmc_address);
                        if let Some(bucket) = bucket {
                            if bucket.in_flight >= queue.config.max_concurrent_per_bmc {
                                continue;
                            }
                            if let Some(last) = bucket.last_dispatch_at {
                                let ready_at = last + queue.config.bmc_cooldown;
                                if ready_at > now {
                                    queue.metrics.cooldown_waits.inc();
                                    next_wake = min_instant(next_wake, ready_at);
                                    continue;
                                }
                            }
                        }
                        chosen = Some(*key);
                        break;
                    }

                    chosen.and_then(|key| inner.pending.remove(&key)).map(|pending| {
                        inner
                            .index
                            .remove(&(pending.entry.host_key.clone(), pending.entry.kind));
                        let bucket = inner
                            .buckets
                            .entry(pending.entry.bmc_address.clone())
                            .or_default();
                        bucket.in_flight += 1;
                        bucket.last_dispatch_at = Some(now);
                        bucket.last_used = Some(now);
                        inner.in_flight_global += 1;
                        queue.metrics
                            .queue_stats
                            .with_label_values(&["depth"])
                            .set(inner.pending.len() as i64);
                        queue.metrics
                            .queue_stats
                            .with_label_values(&["processing"])
                            .set(inner.in_flight_global as i64);
                        pending.entry
                    })
                }
            };

            match dispatched {
                Some(entry) => {
                    debug!(host = %entry.host_key, bmc = %entry.bmc_address, kind = %entry.kind, attempt = entry.attempt, "dispatching");
                    let queue = queue.clone();
                    let runner = runner.clone();
                    tokio::spawn(async move { queue.execute(runner, entry).await });
                }
                None => break,
            }
        }
        next_wake.map(|at| at.saturating_duration_since(Instant::now()))
    }

    async fn execute(self: Arc<Self>, runner: Arc<dyn JobRunner>, entry: QueueEntry) {
        let result = tokio::time::timeout(self.config.dispatch_timeout, runner.run(&entry)).await;
        let result = match result {
            Ok(r) => r,
            Err(_) => Err(RedfishError::Timeout { address: entry.bmc_address.clone() }),
        };

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(bucket) = inner.buckets.get_mut(&entry.bmc_address) {
                bucket.in_flight = bucket.in_flight.saturating_sub(1);
                bucket.last_used = Some(Instant::now());
            }
            inner.in_flight_global = inner.in_flight_global.saturating_sub(1);
            self.metrics
                .queue_stats
                .with_label_values(&["processing"])
                .set(inner.in_flight_global as i64);
        }

        match result {
            Ok(()) => {
                debug!(host = %entry.host_key, kind = %entry.kind, "operation complete");
            }
            Err(err) => {
                self.metrics
                    .errors_total
                    .with_label_values(&[&err.kind().to_string()])
                    .inc();
                let next_attempt = entry.attempt + 1;
                if err.kind().is_retryable() && next_attempt < self.config.max_attempts {
                    let delay = retry_backoff(entry.attempt);
                    warn!(
                        host = %entry.host_key,
                        kind = %entry.kind,
                        attempt = next_attempt,
                        delay = ?delay,
                        error = %err,
                        "operation failed, re-enqueueing"
                    );
                    self.requeue(QueueEntry { attempt: next_attempt, ..entry }, delay);
                } else {
                    warn!(
                        host = %entry.host_key,
                        kind = %entry.kind,
                        attempts = next_attempt,
                        error = %err,
                        "operation failed terminally"
                    );
                    runner.failed(&entry, &err).await;
                }
            }
        }
        self.wake.notify_one();
    }

    fn requeue(&self, entry: QueueEntry, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.len() >= self.config.max_queue_depth {
            // Nothing sensible left to do; the host controller re-enqueues
            // on its next round.
            warn!(host = %entry.host_key, "queue full on retry re-enqueue, dropping");
            return;
        }
        inner.seq += 1;
        let key = (Reverse(entry.priority), inner.seq);
        inner.index.insert((entry.host_key.clone(), entry.kind), key);
        inner
            .pending
            .insert(key, Pending { entry, not_before: Some(Instant::now() + delay) });
        self.metrics
            .queue_stats
            .with_label_values(&["depth"])
            .set(inner.pending.len() as i64);
    }

    fn evict_idle_buckets(&self, inner: &mut Inner, now: Instant) {
        inner.buckets.retain(|_, bucket| {
            bucket.in_flight > 0
                || bucket
                    .last_used
                    .map_or(false, |t| now.saturating_duration_since(t) < BUCKET_IDLE_EVICTION)
        });
    }

    /// Wait for in-flight work to finish, up to `timeout`. Returns whether
    /// the queue fully drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats().processing == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn retry_backoff(completed_attempts: u32) -> Duration {
    let exp = completed_attempts.min(16);
    (RETRY_BACKOFF_INITIAL * 2u32.saturating_pow(exp)).min(RETRY_BACKOFF_CAP)
}

fn min_instant(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(match current {
        Some(existing) => existing.min(candidate),
        None => candidate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings() -> QueueSettings {
        QueueSettings::default()
    }

    fn entry(host: &str, bmc: &str, kind: OperationKind) -> QueueEntry {
        QueueEntry::new(ObjectKey::new("ns1", host), bmc, kind)
    }

    /// Records dispatch order and timestamps; optionally fails first N runs.
    struct Recorder {
        dispatched: Mutex<Vec<(String, Instant)>>,
        failures_remaining: AtomicU32,
        terminal: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                dispatched: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(0),
                terminal: Mutex::new(Vec::new()),
            })
        }

        fn fail_next(&self, n: u32) {
            self.failures_remaining.store(n, Ordering::SeqCst);
        }

        fn dispatched(&self) -> Vec<(String, Instant)> {
            self.dispatched.lock().unwrap().clone()
        }

        fn terminal(&self) -> Vec<String> {
            self.terminal.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobRunner for Recorder {
        async fn run(&self, entry: &QueueEntry) -> Result<(), RedfishError> {
            self.dispatched
                .lock()
                .unwrap()
                .push((entry.host_key.name.clone(), Instant::now()));
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(RedfishError::Http {
                    status: 500,
                    path: "/".into(),
                    message: "injected".into(),
                });
            }
            Ok(())
        }

        async fn failed(&self, entry: &QueueEntry, _error: &RedfishError) {
            self.terminal.lock().unwrap().push(entry.host_key.name.clone());
        }
    }

    fn start(
        config: QueueSettings,
        runner: Arc<Recorder>,
    ) -> (Arc<ProvisioningQueue>, watch::Sender<bool>) {
        let queue = ProvisioningQueue::new(config, Arc::new(Metrics::new()));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(queue.clone().run(runner, rx));
        (queue, tx)
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_in_priority_then_fifo_order() {
        let mut config = settings();
        // Serialize everything through one BMC slot so order is observable.
        config.max_concurrent_per_bmc = 1;
        config.bmc_cooldown = Duration::from_secs(30);
        let runner = Recorder::new();
        let (queue, _tx) = start(config, runner.clone());

        assert_eq!(
            queue.enqueue(entry("low-1", "bmc-A", OperationKind::Provision)),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            queue.enqueue(entry("low-2", "bmc-A", OperationKind::Deprovision)),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            queue.enqueue(
                entry("high", "bmc-A", OperationKind::PowerOp).with_priority(10)
            ),
            EnqueueOutcome::Queued
        );

        tokio::time::sleep(Duration::from_secs(120)).await;
        let order: Vec<String> = runner.dispatched().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["high", "low-1", "low-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn bmc_cooldown_spaces_dispatches() {
        let mut config = settings();
        config.max_concurrent_per_bmc = 1;
        config.bmc_cooldown = Duration::from_secs(30);
        let runner = Recorder::new();
        let (queue, _tx) = start(config, runner.clone());

        for i in 0..10 {
            assert_eq!(
                queue.enqueue(entry(&format!("h{i}"), "bmc-A", OperationKind::Provision)),
                EnqueueOutcome::Queued
            );
        }

        let started = Instant::now();
        tokio::time::sleep(Duration::from_secs(600)).await;

        let dispatched = runner.dispatched();
        assert_eq!(dispatched.len(), 10);
        for pair in dispatched.windows(2) {
            let gap = pair[1].1.saturating_duration_since(pair[0].1);
            assert!(gap >= Duration::from_secs(30), "gap {gap:?} under cooldown");
        }
        // Nine cooldown intervals minimum to drain ten entries.
        let drained_in = dispatched.last().unwrap().1.saturating_duration_since(started);
        assert!(drained_in >= Duration::from_secs(270), "drained in {drained_in:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_bmcs_are_not_serialized() {
        let runner = Recorder::new();
        let (queue, _tx) = start(settings(), runner.clone());

        for i in 0..3 {
            queue.enqueue(entry(&format!("h{i}"), &format!("bmc-{i}"), OperationKind::Provision));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runner.dispatched().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn global_cap_bounds_concurrency() {
        let mut config = settings();
        config.max_concurrent_global = 2;
        // Distinct BMCs, so only the global cap constrains.
        let runner = Recorder::new();
        let (queue, _tx) = start(config, runner.clone());

        for i in 0..5 {
            queue.enqueue(entry(&format!("h{i}"), &format!("bmc-{i}"), OperationKind::Provision));
        }
        tokio::task::yield_now().await;
        assert!(queue.stats().processing <= 2);
        // Everything still drains once workers complete.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runner.dispatched().len(), 5);
    }

    #[tokio::test]
    async fn queue_full_rejects_without_side_effects() {
        let mut config = settings();
        config.max_queue_depth = 2;
        let queue = ProvisioningQueue::new(config, Arc::new(Metrics::new()));

        assert_eq!(
            queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision)),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            queue.enqueue(entry("h2", "bmc-A", OperationKind::Provision)),
            EnqueueOutcome::Queued
        );
        let before = queue.stats();
        assert_eq!(
            queue.enqueue(entry("h3", "bmc-A", OperationKind::Provision)),
            EnqueueOutcome::QueueFull
        );
        assert_eq!(queue.stats(), before);
    }

    #[tokio::test]
    async fn duplicate_entries_are_suppressed() {
        let queue = ProvisioningQueue::new(settings(), Arc::new(Metrics::new()));
        assert_eq!(
            queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision)),
            EnqueueOutcome::Queued
        );
        assert_eq!(
            queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision)),
            EnqueueOutcome::Duplicate
        );
        // A different operation kind for the same host is fine.
        assert_eq!(
            queue.enqueue(entry("h1", "bmc-A", OperationKind::PowerOp)),
            EnqueueOutcome::Queued
        );
    }

    #[tokio::test]
    async fn enqueue_then_cancel_restores_depth() {
        let queue = ProvisioningQueue::new(settings(), Arc::new(Metrics::new()));
        queue.enqueue(entry("keep", "bmc-A", OperationKind::Provision));
        let before = queue.stats();

        queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision));
        queue.enqueue(entry("h1", "bmc-A", OperationKind::PowerOp));
        assert_eq!(queue.cancel(&ObjectKey::new("ns1", "h1")), 2);
        assert_eq!(queue.stats(), before);

        // Cancelled entries can be re-enqueued.
        assert_eq!(
            queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision)),
            EnqueueOutcome::Queued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_back_off_then_succeed() {
        let mut config = settings();
        config.bmc_cooldown = Duration::from_secs(1);
        let runner = Recorder::new();
        runner.fail_next(2);
        let (queue, _tx) = start(config, runner.clone());

        queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision));
        tokio::time::sleep(Duration::from_secs(60)).await;

        // Two failures, then success; no terminal report.
        assert_eq!(runner.dispatched().len(), 3);
        assert!(runner.terminal().is_empty());
        assert_eq!(queue.stats(), QueueStats { depth: 0, processing: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_terminal_failure() {
        let mut config = settings();
        config.max_attempts = 3;
        config.bmc_cooldown = Duration::from_secs(1);
        let runner = Recorder::new();
        runner.fail_next(10);
        let (queue, _tx) = start(config, runner.clone());

        queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision));
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(runner.dispatched().len(), 3);
        assert_eq!(runner.terminal(), vec!["h1".to_string()]);
        assert_eq!(queue.stats().depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buckets_are_evicted() {
        let runner = Recorder::new();
        let (queue, _tx) = start(settings(), runner.clone());

        queue.enqueue(entry("h1", "bmc-A", OperationKind::Provision));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.bucket_count(), 1);

        // Over an hour idle; the next dispatch scan drops the bucket.
        tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
        queue.enqueue(entry("h2", "bmc-B", OperationKind::Provision));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.bucket_count(), 1); // only bmc-B remains
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(1));
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(20), Duration::from_secs(300));
    }
}
