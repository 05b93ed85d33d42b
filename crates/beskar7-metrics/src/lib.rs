//! Process-wide Prometheus instruments.
//!
//! Built once at startup against a dedicated registry and shared by `Arc`;
//! the manager's `/metrics` endpoint renders the exposition text.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    /// Hosts per lifecycle state: labels `{namespace, state}`.
    pub host_state: IntGaugeVec,
    /// Claim attempts: labels `{outcome}`.
    pub claim_attempts: IntCounterVec,
    /// Claim conflicts by reason: labels `{reason}`.
    pub claim_conflicts: IntCounterVec,
    /// Wall-clock of a whole claim call, seconds.
    pub claim_duration: HistogramVec,
    /// Candidate selection time inside the critical section, seconds.
    pub selection_duration: HistogramVec,
    /// Queue gauges: labels `{stat}` ∈ {depth, processing}.
    pub queue_stats: IntGaugeVec,
    /// Dispatches deferred because a BMC was cooling down.
    pub cooldown_waits: IntCounter,
    /// Reconcile rounds: labels `{controller, outcome}`.
    pub reconcile_total: IntCounterVec,
    /// Reconcile duration, seconds: labels `{controller}`.
    pub reconcile_duration: HistogramVec,
    /// Errors by taxonomy kind: labels `{kind}`.
    pub errors_total: IntCounterVec,
    /// Leader election events: labels `{event}` ∈ {acquired, renewed, lost}.
    pub leader_events: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let host_state = IntGaugeVec::new(
            Opts::new("beskar7_host_state", "Number of hosts per lifecycle state"),
            &["namespace", "state"],
        )
        .unwrap();
        let claim_attempts = IntCounterVec::new(
            Opts::new("beskar7_claim_attempts_total", "Host claim attempts by outcome"),
            &["outcome"],
        )
        .unwrap();
        let claim_conflicts = IntCounterVec::new(
            Opts::new("beskar7_claim_conflicts_total", "Host claim conflicts by reason"),
            &["reason"],
        )
        .unwrap();
        let claim_duration = HistogramVec::new(
            HistogramOpts::new("beskar7_claim_duration_seconds", "Duration of claim calls"),
            &["outcome"],
        )
        .unwrap();
        let selection_duration = HistogramVec::new(
            HistogramOpts::new(
                "beskar7_host_selection_duration_seconds",
                "Duration of candidate selection",
            ),
            &["namespace"],
        )
        .unwrap();
        let queue_stats = IntGaugeVec::new(
            Opts::new("beskar7_provisioning_queue", "Provisioning queue gauges"),
            &["stat"],
        )
        .unwrap();
        let cooldown_waits = IntCounter::new(
            "beskar7_bmc_cooldown_waits_total",
            "Dispatches deferred by BMC cooldown",
        )
        .unwrap();
        let reconcile_total = IntCounterVec::new(
            Opts::new("beskar7_reconcile_total", "Reconcile rounds by controller and outcome"),
            &["controller", "outcome"],
        )
        .unwrap();
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("beskar7_reconcile_duration_seconds", "Reconcile round duration"),
            &["controller"],
        )
        .unwrap();
        let errors_total = IntCounterVec::new(
            Opts::new("beskar7_errors_total", "Errors by taxonomy kind"),
            &["kind"],
        )
        .unwrap();
        let leader_events = IntCounterVec::new(
            Opts::new("beskar7_leader_election_events_total", "Leader election events"),
            &["event"],
        )
        .unwrap();

        for metric in [
            Box::new(host_state.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(claim_attempts.clone()),
            Box::new(claim_conflicts.clone()),
            Box::new(claim_duration.clone()),
            Box::new(selection_duration.clone()),
            Box::new(queue_stats.clone()),
            Box::new(cooldown_waits.clone()),
            Box::new(reconcile_total.clone()),
            Box::new(reconcile_duration.clone()),
            Box::new(errors_total.clone()),
            Box::new(leader_events.clone()),
        ] {
            registry.register(metric).unwrap();
        }

        Metrics {
            registry,
            host_state,
            claim_attempts,
            claim_conflicts,
            claim_duration,
            selection_duration,
            queue_stats,
            cooldown_waits,
            reconcile_total,
            reconcile_duration,
            errors_total,
            leader_events,
        }
    }

    /// Render the exposition text for the `/metrics` endpoint.
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .expect("text encoding cannot fail on an in-memory buffer");
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruments_register_and_render() {
        let metrics = Metrics::new();
        metrics.claim_attempts.with_label_values(&["Success"]).inc();
        metrics.host_state.with_label_values(&["ns1", "Available"]).set(2);
        metrics.queue_stats.with_label_values(&["depth"]).set(7);
        metrics.cooldown_waits.inc();

        let text = metrics.gather();
        assert!(text.contains("beskar7_claim_attempts_total"));
        assert!(text.contains("beskar7_host_state"));
        assert!(text.contains("beskar7_provisioning_queue"));
    }

    #[test]
    fn two_instances_do_not_collide() {
        // Separate registries: safe to build per test.
        let a = Metrics::new();
        let b = Metrics::new();
        a.errors_total.with_label_values(&["timeout"]).inc();
        assert!(!b.gather().contains("timeout"));
    }
}
