use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beskar7_config::LeaderSettings;
use beskar7_metrics::Metrics;
use beskar7_store::{ObjectStore, StoreError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Serializes claim attempts across replicas through the store's lease
/// primitive.
///
/// Advisory for correctness (the CAS is the final arbiter of single
/// ownership) but load-bearing for throughput: without it every replica
/// would burn store round-trips losing CAS races.
pub struct LeaderGate {
    store: Arc<dyn ObjectStore>,
    metrics: Arc<Metrics>,
    lease_name: String,
    holder: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    is_leader: AtomicBool,
}

impl LeaderGate {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        settings: &LeaderSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        LeaderGate {
            store,
            metrics,
            lease_name: settings.lease_name.clone(),
            holder: Uuid::new_v4().to_string(),
            lease_duration: settings.lease_duration,
            renew_deadline: settings.renew_deadline,
            retry_period: settings.retry_period,
            is_leader: AtomicBool::new(false),
        }
    }

    /// This process's lease identity.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquire or renew the lease. Returns whether this process is the
    /// leader right now. A store failure drops the local flag; the lease
    /// itself just expires at the store.
    pub async fn try_enter(&self) -> Result<bool, StoreError> {
        let attempt = tokio::time::timeout(
            self.renew_deadline,
            self.store
                .try_acquire_lease(&self.lease_name, &self.holder, self.lease_duration),
        )
        .await;

        let acquired = match attempt {
            Ok(result) => result?,
            Err(_) => {
                warn!(lease = %self.lease_name, "lease renewal timed out");
                false
            }
        };

        let was_leader = self.is_leader.swap(acquired, Ordering::SeqCst);
        match (was_leader, acquired) {
            (false, true) => {
                info!(lease = %self.lease_name, holder = %self.holder, "acquired leadership");
                self.metrics.leader_events.with_label_values(&["acquired"]).inc();
            }
            (true, true) => {
                self.metrics.leader_events.with_label_values(&["renewed"]).inc();
            }
            (true, false) => {
                warn!(lease = %self.lease_name, holder = %self.holder, "lost leadership");
                self.metrics.leader_events.with_label_values(&["lost"]).inc();
            }
            (false, false) => {}
        }
        Ok(acquired)
    }

    /// Leadership as of the last `try_enter`. Cheap re-check inside a
    /// critical section; the authoritative answer is `try_enter`.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Background renewal: keeps the lease warm every `retry_period` until
    /// shutdown, then releases it so a peer can take over immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.retry_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.try_enter().await {
                        warn!(error = %e, "lease renewal failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(lease = %self.lease_name, "relinquishing lease on shutdown");
                    let _ = self.relinquish().await;
                    return;
                }
            }
        }
    }

    pub async fn relinquish(&self) -> Result<(), StoreError> {
        if self.is_leader.swap(false, Ordering::SeqCst) {
            self.metrics.leader_events.with_label_values(&["lost"]).inc();
        }
        self.store.release_lease(&self.lease_name, &self.holder).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beskar7_store::InMemoryStore;

    fn gate(store: Arc<InMemoryStore>) -> LeaderGate {
        LeaderGate::new(store, &LeaderSettings::default(), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn single_gate_becomes_leader() {
        let store = Arc::new(InMemoryStore::new());
        let gate = gate(store);
        assert!(gate.try_enter().await.unwrap());
        assert!(gate.is_leader());
    }

    #[tokio::test]
    async fn second_gate_is_excluded_until_release() {
        let store = Arc::new(InMemoryStore::new());
        let a = gate(store.clone());
        let b = gate(store);

        assert!(a.try_enter().await.unwrap());
        assert!(!b.try_enter().await.unwrap());
        assert!(!b.is_leader());

        a.relinquish().await.unwrap();
        assert!(!a.is_leader());
        assert!(b.try_enter().await.unwrap());
    }

    #[tokio::test]
    async fn renewal_keeps_the_same_holder() {
        let store = Arc::new(InMemoryStore::new());
        let a = gate(store.clone());
        assert!(a.try_enter().await.unwrap());
        assert!(a.try_enter().await.unwrap());
        assert_eq!(
            store.lease_holder(&LeaderSettings::default().lease_name).await.unwrap().as_deref(),
            Some(a.holder())
        );
    }
}
