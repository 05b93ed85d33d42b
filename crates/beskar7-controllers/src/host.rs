use std::sync::Arc;

use async_trait::async_trait;
use beskar7_domain::{
    conditions, host_state::transition_allowed, ConditionStatus, ErrorKind, HardwareDetails,
    HostState, ObjectKey, PhysicalHost, PowerState, HOST_FINALIZER,
};
use beskar7_queue::{EnqueueOutcome, JobRunner, OperationKind, QueueEntry};
use beskar7_redfish::{
    BootSourceOverride, PowerAction, RedfishClient, RedfishError, SystemInfo, VirtualMediaStatus,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::ReconcileError;
use crate::retry::RetryPolicy;
use crate::runtime::{Reconciler, Requeue};

/// Priorities: releases free capacity, so they outrank new provisions.
const PRIORITY_DEPROVISION: i32 = 10;
const PRIORITY_PROVISION: i32 = 0;

/// Observes one PhysicalHost, advances its lifecycle state machine, and
/// requests Redfish side effects through the provisioning queue. Side
/// effects are never performed inline.
pub struct HostReconciler {
    ctx: Arc<Context>,
    retry: RetryPolicy,
}

impl HostReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        let retry = RetryPolicy::new(ctx.settings.retry.clone());
        HostReconciler { ctx, retry }
    }

    async fn reconcile_host(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let Some(host) = self.ctx.store.get_host(key).await? else {
            debug!(host = %key, "host gone");
            return Ok(Requeue::No);
        };

        if host.metadata.is_deleting() {
            return self.reconcile_delete(host).await;
        }

        let mut host = host;
        if !host.metadata.has_finalizer(HOST_FINALIZER) {
            host.metadata.add_finalizer(HOST_FINALIZER);
            host = self.ctx.store.update_host(&host).await?;
        }

        let pacing = &self.ctx.settings.controller;
        let original = host.clone();

        if matches!(host.status.state, HostState::None | HostState::Unknown) {
            host.status.state = HostState::Enrolling;
        }

        // Credentials and Redfish session; nothing below runs without them.
        let outcome = match self.connect(&host).await {
            Ok(client) => self.observe_and_advance(&mut host, client.as_ref()).await?,
            Err(reason) => {
                self.record_connection_failure(&mut host, reason);
                Requeue::After(pacing.requeue_after_error)
            }
        };

        if host != original {
            self.ctx.store.update_host(&host).await?;
        }
        Ok(outcome)
    }

    /// Resolve credentials and open (or reuse) the Redfish session.
    async fn connect(
        &self,
        host: &PhysicalHost,
    ) -> Result<Arc<dyn RedfishClient>, ConnectFailure> {
        let secret = self
            .ctx
            .credentials_secret(host)
            .await
            .map_err(|e| ConnectFailure {
                reason: conditions::REASON_SECRET_NOT_FOUND,
                message: e.to_string(),
            })?
            .ok_or_else(|| ConnectFailure {
                reason: conditions::REASON_SECRET_NOT_FOUND,
                message: format!("secret '{}' not found", host.spec.credentials_ref),
            })?;

        let conn = self
            .ctx
            .redfish_connection(host, &secret)
            .await
            .ok_or_else(|| ConnectFailure {
                reason: conditions::REASON_MISSING_CREDENTIALS,
                message: format!(
                    "secret '{}' is missing username/password",
                    host.spec.credentials_ref
                ),
            })?;

        self.retry
            .execute("redfish connect", || self.ctx.redfish.get(&conn))
            .await
            .map_err(|e| ConnectFailure {
                reason: conditions::REASON_REDFISH_CONNECTION_FAILED,
                message: e.to_string(),
            })
    }

    fn record_connection_failure(&self, host: &mut PhysicalHost, failure: ConnectFailure) {
        warn!(host = %host.key(), reason = failure.reason, error = %failure.message, "redfish unavailable");
        self.ctx
            .metrics
            .errors_total
            .with_label_values(&[&ErrorKind::Connection.to_string()])
            .inc();
        conditions::set_condition(
            &mut host.status.conditions,
            conditions::REDFISH_CONNECTION_READY,
            ConditionStatus::False,
            Some(failure.reason),
            Some(&failure.message),
            Utc::now(),
        );
        host.status.observed_power_state = PowerState::Unknown;
        // An enrolling host keeps retrying enrollment; anything further
        // along has lost its management plane and parks in Error.
        if host.status.state != HostState::Enrolling
            && transition_allowed(host.status.state, HostState::Error)
        {
            host.status.state = HostState::Error;
            host.status.error_message = Some(failure.message);
        }
    }

    async fn observe_and_advance(
        &self,
        host: &mut PhysicalHost,
        client: &dyn RedfishClient,
    ) -> Result<Requeue, ReconcileError> {
        let pacing = &self.ctx.settings.controller;

        let info = match client.get_system_info().await {
            Ok(info) => info,
            Err(e) => {
                self.record_connection_failure(
                    host,
                    ConnectFailure {
                        reason: conditions::REASON_REDFISH_CONNECTION_FAILED,
                        message: e.to_string(),
                    },
                );
                return Ok(Requeue::After(pacing.requeue_after_error));
            }
        };
        host.status.hardware_details = Some(hardware_from(&info));
        conditions::set_condition(
            &mut host.status.conditions,
            conditions::REDFISH_CONNECTION_READY,
            ConditionStatus::True,
            None,
            None,
            Utc::now(),
        );

        // Observed facts refresh every round; a transient read failure
        // degrades to Unknown rather than failing the round.
        host.status.observed_power_state =
            client.get_power_state().await.unwrap_or(PowerState::Unknown);
        let media = client.get_virtual_media().await.unwrap_or_default();

        match host.status.state {
            HostState::Enrolling => {
                host.status.state = HostState::Available;
                host.status.error_message = None;
                info!(host = %host.key(), "host enrolled");
                Ok(Requeue::After(pacing.requeue_interval))
            }
            HostState::Available => Ok(Requeue::After(pacing.requeue_interval)),
            HostState::Claimed => self.advance_claimed(host),
            HostState::Provisioning => Ok(self.advance_provisioning(host, &media)),
            HostState::Provisioned => Ok(Requeue::After(pacing.requeue_interval)),
            HostState::Deprovisioning => Ok(self.advance_deprovisioning(host, &media)),
            HostState::Error => Ok(Requeue::After(pacing.requeue_after_error)),
            HostState::None | HostState::Unknown => {
                // Normalized before we got here.
                Ok(Requeue::After(pacing.requeue_interval))
            }
        }
    }

    fn advance_claimed(&self, host: &mut PhysicalHost) -> Result<Requeue, ReconcileError> {
        let pacing = &self.ctx.settings.controller;
        if host.spec.boot_iso_source.as_deref().map_or(true, str::is_empty) {
            conditions::set_condition(
                &mut host.status.conditions,
                conditions::HOST_PROVISIONED,
                ConditionStatus::False,
                Some(conditions::REASON_WAITING_FOR_BOOT_INFO),
                Some("claimed but no boot ISO source set"),
                Utc::now(),
            );
            return Ok(Requeue::After(pacing.requeue_interval));
        }

        let entry = QueueEntry::new(
            host.key(),
            host.spec.redfish_address.clone(),
            OperationKind::Provision,
        )
        .with_priority(PRIORITY_PROVISION);
        match self.ctx.queue.enqueue(entry) {
            EnqueueOutcome::Queued | EnqueueOutcome::Duplicate => {
                host.status.state = HostState::Provisioning;
                info!(host = %host.key(), "provisioning queued");
                Ok(Requeue::After(pacing.requeue_interval))
            }
            EnqueueOutcome::QueueFull => {
                warn!(host = %host.key(), "provisioning queue full, deferring");
                Ok(Requeue::After(pacing.requeue_after_error))
            }
        }
    }

    fn advance_provisioning(
        &self,
        host: &mut PhysicalHost,
        media: &VirtualMediaStatus,
    ) -> Requeue {
        let pacing = &self.ctx.settings.controller;
        if host.status.observed_power_state == PowerState::On && media.inserted {
            host.status.state = HostState::Provisioned;
            conditions::set_condition(
                &mut host.status.conditions,
                conditions::HOST_PROVISIONED,
                ConditionStatus::True,
                None,
                None,
                Utc::now(),
            );
            info!(host = %host.key(), "host provisioned");
        } else {
            // The queued operation may have been dropped or not yet run;
            // duplicate suppression makes this re-request free.
            let entry = QueueEntry::new(
                host.key(),
                host.spec.redfish_address.clone(),
                OperationKind::Provision,
            )
            .with_priority(PRIORITY_PROVISION);
            let _ = self.ctx.queue.enqueue(entry);
        }
        Requeue::After(pacing.requeue_interval)
    }

    fn advance_deprovisioning(
        &self,
        host: &mut PhysicalHost,
        media: &VirtualMediaStatus,
    ) -> Requeue {
        let pacing = &self.ctx.settings.controller;
        if host.status.observed_power_state == PowerState::Off && !media.inserted {
            host.spec.consumer_ref = None;
            host.spec.boot_iso_source = None;
            host.spec.user_data_ref = None;
            host.status.state = HostState::Available;
            host.status.error_message = None;
            conditions::set_condition(
                &mut host.status.conditions,
                conditions::HOST_PROVISIONED,
                ConditionStatus::False,
                Some("Released"),
                None,
                Utc::now(),
            );
            info!(host = %host.key(), "host released, available again");
        } else {
            let entry = QueueEntry::new(
                host.key(),
                host.spec.redfish_address.clone(),
                OperationKind::Deprovision,
            )
            .with_priority(PRIORITY_DEPROVISION);
            let _ = self.ctx.queue.enqueue(entry);
        }
        Requeue::After(pacing.requeue_interval)
    }

    /// Host deletion. Blocked while a consumer still holds the host;
    /// once free, best-effort cleanup of the BMC and drop the finalizer.
    async fn reconcile_delete(&self, host: PhysicalHost) -> Result<Requeue, ReconcileError> {
        let pacing = &self.ctx.settings.controller;
        if host.spec.consumer_ref.is_some() {
            debug!(host = %host.key(), "deletion blocked by live claim");
            return Ok(Requeue::After(pacing.requeue_interval));
        }

        self.ctx.queue.cancel(&host.key());

        if let Ok(client) = self.connect(&host).await {
            if let Err(e) = client.eject_virtual_media().await {
                warn!(host = %host.key(), error = %e, "eject during deletion failed");
            }
            if let Err(e) = client.set_power_state(PowerAction::Off).await {
                warn!(host = %host.key(), error = %e, "power-off during deletion failed");
            }
        }

        let mut host = host;
        host.metadata.remove_finalizer(HOST_FINALIZER);
        self.ctx.store.update_host(&host).await?;
        info!(host = %host.key(), "host finalized");
        Ok(Requeue::No)
    }
}

struct ConnectFailure {
    reason: &'static str,
    message: String,
}

fn hardware_from(info: &SystemInfo) -> HardwareDetails {
    HardwareDetails {
        manufacturer: info.manufacturer.clone(),
        model: info.model.clone(),
        serial_number: info.serial_number.clone(),
        memory_mib: info.memory_mib,
        cpu_count: info.cpu_count,
    }
}

#[async_trait]
impl Reconciler for HostReconciler {
    fn name(&self) -> &'static str {
        "physicalhost"
    }

    async fn reconcile(&self, key: ObjectKey) -> Result<Requeue, ReconcileError> {
        self.reconcile_host(&key).await
    }

    async fn list_keys(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        let hosts = self.ctx.store.list_hosts(&self.ctx.namespace).await?;

        // Resync doubles as the census for the per-state gauge.
        for state in [
            HostState::None,
            HostState::Enrolling,
            HostState::Available,
            HostState::Claimed,
            HostState::Provisioning,
            HostState::Provisioned,
            HostState::Deprovisioning,
            HostState::Error,
            HostState::Unknown,
        ] {
            let count = hosts.iter().filter(|h| h.status.state == state).count();
            self.ctx
                .metrics
                .host_state
                .with_label_values(&[&self.ctx.namespace, &state.to_string()])
                .set(count as i64);
        }

        Ok(hosts.into_iter().map(|h| h.key()).collect())
    }
}

// ── Queued side-effect execution ─────────────────────────────────────────────

/// Runs dispatched queue entries against the BMC. State transitions remain
/// the host reconciler's job; this runner only performs the Redfish calls
/// (and parks the host in Error on terminal failure).
pub struct RedfishJobRunner {
    ctx: Arc<Context>,
}

impl RedfishJobRunner {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(RedfishJobRunner { ctx })
    }

    async fn client_for(
        &self,
        host: &PhysicalHost,
    ) -> Result<Arc<dyn RedfishClient>, RedfishError> {
        let secret = self
            .ctx
            .credentials_secret(host)
            .await
            .map_err(|e| RedfishError::Query { message: e.to_string() })?
            .ok_or_else(|| RedfishError::Query {
                message: format!("secret '{}' not found", host.spec.credentials_ref),
            })?;
        let conn = self
            .ctx
            .redfish_connection(host, &secret)
            .await
            .ok_or_else(|| RedfishError::Query {
                message: format!("secret '{}' lacks credentials", host.spec.credentials_ref),
            })?;
        self.ctx.redfish.get(&conn).await
    }

    async fn provision(&self, host: &PhysicalHost) -> Result<(), RedfishError> {
        let iso = host
            .spec
            .boot_iso_source
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RedfishError::Boot {
                message: "no boot ISO source on host spec".to_string(),
            })?;

        let client = self.client_for(host).await?;
        client.insert_virtual_media(iso).await?;

        let boot = &self.ctx.settings.boot;
        client
            .set_boot_source_override(&BootSourceOverride {
                enabled: boot.override_enabled.clone(),
                target: boot.override_target.clone(),
                uefi_target: boot.default_efi_path.clone(),
            })
            .await?;

        if let Some(config_url) = host.spec.user_data_ref.as_deref() {
            client
                .set_bios_attribute("KernelArgs", &format!("config_url={config_url}"))
                .await?;
        }

        client.set_power_state(PowerAction::On).await
    }

    async fn deprovision(&self, host: &PhysicalHost) -> Result<(), RedfishError> {
        let client = self.client_for(host).await?;
        client.eject_virtual_media().await?;
        client.set_power_state(PowerAction::Off).await
    }

    async fn power_cycle(&self, host: &PhysicalHost) -> Result<(), RedfishError> {
        let client = self.client_for(host).await?;
        client.set_power_state(PowerAction::Reset).await
    }

    /// CAS loop for the terminal-failure write; a stale read is refreshed a
    /// couple of times before giving up to the next reconcile.
    async fn park_in_error(&self, key: &ObjectKey, reason: &str, message: &str) {
        for _ in 0..3 {
            let Ok(Some(mut host)) = self.ctx.store.get_host(key).await else { return };
            if transition_allowed(host.status.state, HostState::Error) {
                host.status.state = HostState::Error;
            }
            host.status.error_message = Some(message.to_string());
            conditions::set_condition(
                &mut host.status.conditions,
                conditions::HOST_PROVISIONED,
                ConditionStatus::False,
                Some(reason),
                Some(message),
                Utc::now(),
            );
            match self.ctx.store.update_host(&host).await {
                Ok(_) => return,
                Err(e) if e.is_conflict() => continue,
                Err(e) => {
                    warn!(host = %key, error = %e, "failed to record terminal error");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl JobRunner for RedfishJobRunner {
    async fn run(&self, entry: &QueueEntry) -> Result<(), RedfishError> {
        let host = self
            .ctx
            .store
            .get_host(&entry.host_key)
            .await
            .map_err(|e| RedfishError::Query { message: e.to_string() })?;
        let Some(host) = host else {
            debug!(host = %entry.host_key, "host gone before dispatch");
            return Ok(());
        };

        match entry.kind {
            OperationKind::Provision => self.provision(&host).await,
            OperationKind::Deprovision => self.deprovision(&host).await,
            OperationKind::PowerOp => self.power_cycle(&host).await,
        }
    }

    async fn failed(&self, entry: &QueueEntry, error: &RedfishError) {
        self.ctx
            .metrics
            .errors_total
            .with_label_values(&[&error.kind().to_string()])
            .inc();
        let reason = match (entry.kind, error.kind()) {
            (_, ErrorKind::Power) => conditions::REASON_POWER_ON_FAILED,
            (OperationKind::Deprovision, ErrorKind::VirtualMedia) => {
                conditions::REASON_EJECT_MEDIA_FAILED
            }
            (_, ErrorKind::VirtualMedia) | (_, ErrorKind::Boot) => {
                conditions::REASON_SET_BOOT_ISO_FAILED
            }
            _ => conditions::REASON_REDFISH_CONNECTION_FAILED,
        };
        self.park_in_error(&entry.host_key, reason, &error.to_string()).await;
    }
}
