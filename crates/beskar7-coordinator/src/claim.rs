use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use beskar7_domain::{
    validate::selector_matches, Beskar7Machine, ConsumerRef, HostState, ObjectKey, PhysicalHost,
};
use beskar7_metrics::Metrics;
use beskar7_store::ObjectStore;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ClaimError;
use crate::leader::LeaderGate;

/// CAS retries inside one critical section before giving Conflict back to
/// the caller.
const MAX_BIND_ATTEMPTS: usize = 3;

/// Conflict requeue backoff: doubles per conflicted round, capped at 1 min.
const CONFLICT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const CONFLICT_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The machine owns `host`. `already_owned` is true when no store write
    /// happened because the binding pre-existed.
    Success {
        host: PhysicalHost,
        already_owned: bool,
    },
    /// Nothing available matched the selector. Requeue after the configured
    /// no-host interval.
    NoCandidates,
    /// CAS lost beyond the in-section retry budget.
    Conflict { retry_after: Duration },
    /// Another replica holds the lease. Requeue with jitter.
    NotLeader { retry_after: Duration },
}

impl ClaimOutcome {
    fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Success { .. } => "Success",
            ClaimOutcome::NoCandidates => "NoCandidates",
            ClaimOutcome::Conflict { .. } => "Conflict",
            ClaimOutcome::NotLeader { .. } => "NotLeader",
        }
    }
}

/// Per-machine claim bookkeeping. Created on the first attempt, dropped on
/// success or machine deletion.
#[derive(Debug, Default)]
struct ClaimRecord {
    /// Host resource versions at the moment a CAS on them failed. A host is
    /// excluded from selection until its version advances past the marker,
    /// which breaks claim/fail livelock between contending machines.
    failure_markers: HashMap<ObjectKey, u64>,
    /// Conflicts per host, feeding the first ranking criterion.
    failure_counts: HashMap<ObjectKey, u32>,
    /// Next conflict requeue hint.
    backoff: Duration,
}

/// Selects and atomically binds an available host to a claimant.
///
/// The selection runs inside the leader-gated critical section; the bind is
/// an optimistic CAS against the store, which stays the final arbiter of
/// single ownership across processes.
pub struct ClaimCoordinator {
    store: Arc<dyn ObjectStore>,
    gate: Arc<LeaderGate>,
    metrics: Arc<Metrics>,
    records: Mutex<HashMap<Uuid, ClaimRecord>>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, gate: Arc<LeaderGate>, metrics: Arc<Metrics>) -> Self {
        ClaimCoordinator {
            store,
            gate,
            metrics,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Find a suitable host for `machine` and bind it.
    pub async fn claim(&self, machine: &Beskar7Machine) -> Result<ClaimOutcome, ClaimError> {
        let started = Instant::now();
        let outcome = self.claim_inner(machine).await?;
        self.metrics
            .claim_attempts
            .with_label_values(&[outcome.label()])
            .inc();
        self.metrics
            .claim_duration
            .with_label_values(&[outcome.label()])
            .observe(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn claim_inner(&self, machine: &Beskar7Machine) -> Result<ClaimOutcome, ClaimError> {
        let machine_uid = machine
            .metadata
            .uid
            .ok_or_else(|| ClaimError::MissingMachineUid(machine.key().to_string()))?;
        let namespace = machine.metadata.namespace.clone();
        let consumer = ConsumerRef {
            namespace: namespace.clone(),
            name: machine.metadata.name.clone(),
            uid: machine_uid,
        };

        // Idempotence: a binding that already exists is returned as-is, with
        // no store mutation and no leadership requirement.
        let hosts = self.store.list_hosts(&namespace).await?;
        if let Some(owned) = hosts.iter().find(|h| h.is_consumed_by(machine_uid)) {
            self.release(machine_uid).await;
            return Ok(ClaimOutcome::Success { host: owned.clone(), already_owned: true });
        }

        if !self.gate.try_enter().await? {
            return Ok(ClaimOutcome::NotLeader { retry_after: not_leader_jitter() });
        }

        let mut conflicted = false;
        for attempt in 0..MAX_BIND_ATTEMPTS {
            let hosts = self.store.list_hosts(&namespace).await?;

            // A concurrent round may have bound this machine already.
            if let Some(owned) = hosts.iter().find(|h| h.is_consumed_by(machine_uid)) {
                self.release(machine_uid).await;
                return Ok(ClaimOutcome::Success { host: owned.clone(), already_owned: true });
            }

            let selection_started = Instant::now();
            let chosen = {
                let mut records = self.records.lock().await;
                let record = records.entry(machine_uid).or_default();
                let mut candidates =
                    filter_candidates(&hosts, &machine.spec.host_selector, record);
                rank_candidates(&mut candidates, record);
                candidates.first().map(|h| (*h).clone())
            };
            self.metrics
                .selection_duration
                .with_label_values(&[namespace.as_str()])
                .observe(selection_started.elapsed().as_secs_f64());

            let Some(chosen) = chosen else {
                return if conflicted {
                    Ok(self.conflict_outcome(machine_uid).await)
                } else {
                    debug!(machine = %machine.key(), "no claimable hosts");
                    Ok(ClaimOutcome::NoCandidates)
                };
            };

            let mut bound = chosen.clone();
            bound.spec.consumer_ref = Some(consumer.clone());
            bound.status.state = HostState::Claimed;

            match self.store.update_host(&bound).await {
                Ok(updated) => {
                    info!(
                        machine = %machine.key(),
                        host = %updated.key(),
                        attempt,
                        "claimed host"
                    );
                    self.release(machine_uid).await;
                    return Ok(ClaimOutcome::Success { host: updated, already_owned: false });
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        machine = %machine.key(),
                        host = %chosen.key(),
                        attempt,
                        "claim CAS conflict"
                    );
                    conflicted = true;
                    self.metrics
                        .claim_conflicts
                        .with_label_values(&["cas_version_mismatch"])
                        .inc();
                    {
                        let mut records = self.records.lock().await;
                        let record = records.entry(machine_uid).or_default();
                        record
                            .failure_markers
                            .insert(chosen.key(), chosen.metadata.resource_version);
                        *record.failure_counts.entry(chosen.key()).or_insert(0) += 1;
                    }
                    // Lease may have expired while we were racing; treat the
                    // loss as NotLeader rather than continuing to contend.
                    if !self.gate.try_enter().await? {
                        return Ok(ClaimOutcome::NotLeader { retry_after: not_leader_jitter() });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self.conflict_outcome(machine_uid).await)
    }

    /// Drop the claim record for a machine (claim success or deletion).
    pub async fn release(&self, machine_uid: Uuid) {
        self.records.lock().await.remove(&machine_uid);
    }

    async fn conflict_outcome(&self, machine_uid: Uuid) -> ClaimOutcome {
        let mut records = self.records.lock().await;
        let record = records.entry(machine_uid).or_default();
        record.backoff = if record.backoff.is_zero() {
            CONFLICT_BACKOFF_INITIAL
        } else {
            (record.backoff * 2).min(CONFLICT_BACKOFF_CAP)
        };
        ClaimOutcome::Conflict { retry_after: record.backoff }
    }
}

/// Requeue jitter for the NotLeader path: 50–200 ms.
fn not_leader_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(50..=200))
}

/// Candidates: available, selector-matched, and not parked behind a claim
/// failure marker whose resource version has not advanced.
fn filter_candidates<'a>(
    hosts: &'a [PhysicalHost],
    selector: &BTreeMap<String, String>,
    record: &ClaimRecord,
) -> Vec<&'a PhysicalHost> {
    hosts
        .iter()
        .filter(|h| h.is_available())
        .filter(|h| selector_matches(selector, &h.metadata.labels))
        .filter(|h| {
            record
                .failure_markers
                .get(&h.key())
                .map_or(true, |marker| h.metadata.resource_version > *marker)
        })
        .collect()
}

/// Total order: fewer recent failures, then hardware score descending, then
/// `{namespace, name}`. Deterministic across coordinators observing the same
/// snapshot.
fn rank_candidates(candidates: &mut [&PhysicalHost], record: &ClaimRecord) {
    candidates.sort_by_key(|h| {
        let failures = record.failure_counts.get(&h.key()).copied().unwrap_or(0);
        let score = h
            .status
            .hardware_details
            .as_ref()
            .map(|d| d.score())
            .unwrap_or(0);
        (failures, Reverse(score), h.key())
    });
}
