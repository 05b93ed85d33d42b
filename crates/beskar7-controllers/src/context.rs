use std::sync::Arc;

use beskar7_config::Settings;
use beskar7_coordinator::ClaimCoordinator;
use beskar7_metrics::Metrics;
use beskar7_queue::ProvisioningQueue;
use beskar7_redfish::{ClientCache, RedfishConnection};
use beskar7_store::{ObjectStore, Secret, StoreError};
use beskar7_domain::PhysicalHost;

/// Shared dependencies of every reconciler.
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub redfish: Arc<ClientCache>,
    pub queue: Arc<ProvisioningQueue>,
    pub coordinator: Arc<ClaimCoordinator>,
    pub metrics: Arc<Metrics>,
    pub settings: Arc<Settings>,
    /// Namespace this manager instance watches.
    pub namespace: String,
}

impl Context {
    /// Resolve the host's credentials secret and assemble the connection
    /// parameters for its BMC.
    pub async fn redfish_connection(
        &self,
        host: &PhysicalHost,
        secret: &Secret,
    ) -> Option<RedfishConnection> {
        let (username, password) = secret.basic_credentials()?;
        Some(RedfishConnection {
            address: host.spec.redfish_address.clone(),
            username,
            password,
            insecure_skip_verify: host.spec.insecure_skip_verify,
            timeout: self.settings.redfish.timeout,
        })
    }

    pub async fn credentials_secret(
        &self,
        host: &PhysicalHost,
    ) -> Result<Option<Secret>, StoreError> {
        let key = beskar7_domain::ObjectKey::new(
            host.metadata.namespace.clone(),
            host.spec.credentials_ref.clone(),
        );
        self.store.get_secret(&key).await
    }
}
