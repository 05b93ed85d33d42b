use std::sync::Arc;

use async_trait::async_trait;
use beskar7_coordinator::ClaimOutcome;
use beskar7_domain::{
    conditions, format_provider_id, parse_provider_id, validate_machine, Beskar7Machine,
    ConditionStatus, HostState, MachinePhase, ObjectKey, PhysicalHost, ProvisioningMode,
    MACHINE_FINALIZER,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::ReconcileError;
use crate::runtime::{Reconciler, Requeue};

/// Drives a Beskar7Machine to `Running` by claiming a host, stamping boot
/// parameters on it, and mirroring the host's progress back onto the
/// machine.
pub struct MachineReconciler {
    ctx: Arc<Context>,
}

impl MachineReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        MachineReconciler { ctx }
    }

    async fn reconcile_machine(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let Some(machine) = self.ctx.store.get_machine(key).await? else {
            debug!(machine = %key, "machine gone");
            return Ok(Requeue::No);
        };

        if machine.metadata.is_deleting() {
            return self.reconcile_delete(machine).await;
        }

        // Finalizer first, so an interrupted claim can always be unwound.
        let mut machine = machine;
        if !machine.metadata.has_finalizer(MACHINE_FINALIZER) {
            machine.metadata.add_finalizer(MACHINE_FINALIZER);
            machine = self.ctx.store.update_machine(&machine).await?;
        }

        if let Err(e) = validate_machine(&machine) {
            warn!(machine = %key, error = %e, "machine spec rejected");
            machine.status.phase = MachinePhase::Failed;
            machine.status.failure_reason = Some("ValidationFailed".to_string());
            machine.status.failure_message = Some(e.to_string());
            self.ctx.store.update_machine(&machine).await?;
            return Ok(Requeue::No);
        }

        if machine.status.phase == MachinePhase::Failed {
            // Terminal; a human clears this.
            return Ok(Requeue::No);
        }

        match machine.spec.provider_id.clone() {
            None => self.claim_host(machine).await,
            Some(provider_id) => self.observe_host(machine, &provider_id).await,
        }
    }

    async fn claim_host(&self, mut machine: Beskar7Machine) -> Result<Requeue, ReconcileError> {
        let pacing = &self.ctx.settings.controller;
        match self.ctx.coordinator.claim(&machine).await? {
            ClaimOutcome::Success { host, already_owned } => {
                let host = self.write_boot_parameters(&machine, host).await?;
                machine.spec.provider_id = Some(format_provider_id(
                    &host.metadata.namespace,
                    &host.metadata.name,
                ));
                machine.status.phase = MachinePhase::Provisioning;
                conditions::set_condition(
                    &mut machine.status.conditions,
                    conditions::MACHINE_READY,
                    ConditionStatus::False,
                    Some("ProvisioningHost"),
                    Some(&format!("host {} claimed", host.key())),
                    Utc::now(),
                );
                self.ctx.store.update_machine(&machine).await?;
                info!(machine = %machine.key(), host = %host.key(), already_owned, "machine bound");
                Ok(Requeue::After(pacing.requeue_interval))
            }
            ClaimOutcome::NoCandidates => {
                conditions::set_condition(
                    &mut machine.status.conditions,
                    conditions::MACHINE_READY,
                    ConditionStatus::False,
                    Some(conditions::REASON_WAITING_FOR_PHYSICAL_HOST),
                    Some("no available host matches the selector"),
                    Utc::now(),
                );
                self.ctx.store.update_machine(&machine).await?;
                Ok(Requeue::After(pacing.requeue_after_no_host))
            }
            ClaimOutcome::Conflict { retry_after } | ClaimOutcome::NotLeader { retry_after } => {
                Ok(Requeue::After(retry_after))
            }
        }
    }

    /// Stamp what to boot onto the claimed host. `userDataRef` carries the
    /// config URL in RemoteConfig mode.
    async fn write_boot_parameters(
        &self,
        machine: &Beskar7Machine,
        host: PhysicalHost,
    ) -> Result<PhysicalHost, ReconcileError> {
        let user_data = match machine.spec.provisioning_mode {
            ProvisioningMode::RemoteConfig => machine.spec.config_url.clone(),
            ProvisioningMode::PreBakedIso => None,
        };
        if host.spec.boot_iso_source.as_deref() == Some(machine.spec.image_url.as_str())
            && host.spec.user_data_ref == user_data
        {
            return Ok(host);
        }
        let mut host = host;
        host.spec.boot_iso_source = Some(machine.spec.image_url.clone());
        host.spec.user_data_ref = user_data;
        Ok(self.ctx.store.update_host(&host).await?)
    }

    async fn observe_host(
        &self,
        mut machine: Beskar7Machine,
        provider_id: &str,
    ) -> Result<Requeue, ReconcileError> {
        let pacing = &self.ctx.settings.controller;
        let (namespace, name) = parse_provider_id(provider_id)?;
        let host_key = ObjectKey::new(namespace, name);
        let machine_uid = machine
            .metadata
            .uid
            .ok_or_else(|| ReconcileError::Internal(format!("machine {} has no uid", machine.key())))?;

        let host = self.ctx.store.get_host(&host_key).await?;
        let owned = host.as_ref().map_or(false, |h| h.is_consumed_by(machine_uid));
        let Some(host) = host.filter(|_| owned) else {
            // The binding this machine recorded no longer exists; a human
            // must decide what happened to the workload.
            warn!(machine = %machine.key(), host = %host_key, "claim lost");
            machine.status.phase = MachinePhase::Failed;
            machine.status.ready = false;
            machine.status.failure_reason = Some(conditions::REASON_CLAIM_LOST.to_string());
            machine.status.failure_message =
                Some(format!("host {host_key} is no longer bound to this machine"));
            self.ctx.store.update_machine(&machine).await?;
            return Ok(Requeue::No);
        };

        match host.status.state {
            HostState::Provisioned => {
                let already_running = machine.status.phase == MachinePhase::Running
                    && machine.status.ready
                    && machine.status.addresses == host.status.addresses;
                if !already_running {
                    machine.status.addresses = host.status.addresses.clone();
                    machine.status.phase = MachinePhase::Running;
                    machine.status.ready = true;
                    conditions::set_condition(
                        &mut machine.status.conditions,
                        conditions::MACHINE_READY,
                        ConditionStatus::True,
                        None,
                        None,
                        Utc::now(),
                    );
                    self.ctx.store.update_machine(&machine).await?;
                    info!(machine = %machine.key(), "machine running");
                }
                Ok(Requeue::After(pacing.requeue_interval))
            }
            HostState::Error => {
                machine.status.phase = MachinePhase::Failed;
                machine.status.ready = false;
                machine.status.failure_reason = Some("HostFailed".to_string());
                machine.status.failure_message = host.status.error_message.clone();
                self.ctx.store.update_machine(&machine).await?;
                Ok(Requeue::No)
            }
            _ => {
                if machine.status.phase != MachinePhase::Provisioning {
                    machine.status.phase = MachinePhase::Provisioning;
                    self.ctx.store.update_machine(&machine).await?;
                }
                Ok(Requeue::After(pacing.requeue_interval))
            }
        }
    }

    /// Teardown: release the host, wait for it to come back to Available,
    /// then drop the finalizer.
    async fn reconcile_delete(
        &self,
        mut machine: Beskar7Machine,
    ) -> Result<Requeue, ReconcileError> {
        let pacing = &self.ctx.settings.controller;
        if machine.status.phase != MachinePhase::Deleting {
            machine.status.phase = MachinePhase::Deleting;
            machine = self.ctx.store.update_machine(&machine).await?;
        }

        let machine_uid = machine.metadata.uid;
        let mut still_bound = false;

        if let Some(provider_id) = machine.spec.provider_id.clone() {
            let (namespace, name) = parse_provider_id(&provider_id)?;
            let host_key = ObjectKey::new(namespace, name);
            if let Some(host) = self.ctx.store.get_host(&host_key).await? {
                let owned =
                    machine_uid.map_or(false, |uid| host.is_consumed_by(uid));
                if owned {
                    still_bound = true;
                    match host.status.state {
                        HostState::Claimed
                        | HostState::Provisioning
                        | HostState::Provisioned => {
                            let mut host = host;
                            host.status.state = HostState::Deprovisioning;
                            match self.ctx.store.update_host(&host).await {
                                Ok(_) => {
                                    info!(machine = %machine.key(), host = %host_key, "host deprovisioning");
                                }
                                Err(e) if e.is_conflict() => {
                                    debug!(host = %host_key, "deprovision CAS conflict, retrying");
                                }
                                Err(e) => return Err(e.into()),
                            }
                        }
                        HostState::Deprovisioning => {
                            debug!(host = %host_key, "waiting for host release");
                        }
                        _ => still_bound = false,
                    }
                }
            }
        }

        if still_bound {
            return Ok(Requeue::After(pacing.requeue_interval));
        }

        if let Some(uid) = machine_uid {
            self.ctx.coordinator.release(uid).await;
        }
        if machine.metadata.has_finalizer(MACHINE_FINALIZER) {
            machine.metadata.remove_finalizer(MACHINE_FINALIZER);
            self.ctx.store.update_machine(&machine).await?;
        }
        info!(machine = %machine.key(), "machine released");
        Ok(Requeue::No)
    }
}

#[async_trait]
impl Reconciler for MachineReconciler {
    fn name(&self) -> &'static str {
        "beskar7machine"
    }

    async fn reconcile(&self, key: ObjectKey) -> Result<Requeue, ReconcileError> {
        self.reconcile_machine(&key).await
    }

    async fn list_keys(&self) -> Result<Vec<ObjectKey>, ReconcileError> {
        Ok(self
            .ctx
            .store
            .list_machines(&self.ctx.namespace)
            .await?
            .into_iter()
            .map(|m| m.key())
            .collect())
    }
}
