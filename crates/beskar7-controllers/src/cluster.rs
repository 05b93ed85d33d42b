use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use beskar7_domain::{
    conditions, validate_cluster, Beskar7Cluster, ConditionStatus, ObjectKey, PhysicalHost,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::ReconcileError;
use crate::runtime::{Reconciler, Requeue};

/// Derives failure domains from host labels and reports control-plane
/// endpoint readiness.
pub struct ClusterReconciler {
    ctx: Arc<Context>,
}

impl ClusterReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        ClusterReconciler { ctx }
    }

    async fn reconcile_cluster(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let Some(cluster) = self.ctx.store.get_cluster(key).await? else {
            debug!(cluster = %key, "cluster gone");
            return Ok(Requeue::No);
        };
        let mut cluster = cluster;
        let original = cluster.clone();

        if let Err(e) = validate_cluster(&cluster) {
            warn!(cluster = %key, error = %e, "cluster spec rejected");
            conditions::set_condition(
                &mut cluster.status.conditions,
                conditions::FAILURE_DOMAINS_READY,
                ConditionStatus::False,
                Some("ValidationFailed"),
                Some(&e.to_string()),
                Utc::now(),
            );
            self.ctx.store.update_cluster(&cluster).await?;
            return Ok(Requeue::No);
        }

        let hosts = self.ctx.store.list_hosts(&cluster.metadata.namespace).await?;
        let domains = discover_failure_domains(&cluster, &hosts);

        let endpoint_ready = cluster.spec.control_plane_endpoint.is_set();
        conditions::set_condition(
            &mut cluster.status.conditions,
            conditions::CONTROL_PLANE_ENDPOINT_READY,
            if endpoint_ready { ConditionStatus::True } else { ConditionStatus::False },
            (!endpoint_ready).then_some("EndpointNotSet"),
            None,
            Utc::now(),
        );
        conditions::set_condition(
            &mut cluster.status.conditions,
            conditions::FAILURE_DOMAINS_READY,
            if domains.is_empty() { ConditionStatus::False } else { ConditionStatus::True },
            domains.is_empty().then_some("NoFailureDomainsDiscovered"),
            None,
            Utc::now(),
        );

        cluster.status.failure_domains = domains;
        cluster.status.ready = endpoint_ready;

        if cluster != original {
            self.ctx.store.update_cluster(&cluster).await?;
            info!(
                cluster = %key,
                domains = cluster.status.failure_domains.len(),
                ready = cluster.status.ready,
                "cluster status updated"
            );
        }
        Ok(Requeue::After(self.ctx.settings.controller.requeue_interval))
    }
}

/// Group hosts by the first label key from `failureDomainLabels` present on
/// each host; the distinct values form the failure-domain set.
fn discover_failure_domains(
    cluster: &Beskar7Cluster,
    hosts: &[PhysicalHost],
) -> BTreeSet<String> {
    let mut domains = BTreeSet::new();
    for host in hosts {
        let value = cluster
            .spec
            .failure_domain_labels
            .iter()
            .find_map(|label| host.metadata.labels.get(label));
        if let Some(value) = value {
            domains.insert(value.clone());
        }
    }
    domains
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    fn name(&self) -> &'static str {
        "beskar7cluster"
    }

    async fn reconcile(&self, key: ObjectKey) -> Result<Requeue, ReconcileError> {
        self.reconcile_cluster(&key).await
    }

    async fn list_keys(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        Ok(self
            .ctx
            .store
            .list_clusters(&self.ctx.namespace)
            .await?
            .into_iter()
            .map(|c| c.key())
            .collect())
    }
}
