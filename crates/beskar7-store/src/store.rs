use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use beskar7_domain::{Beskar7Cluster, Beskar7Machine, ObjectKey, ObjectMeta, PhysicalHost};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Opaque credential holder referenced by `PhysicalHostSpec.credentialsRef`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    /// BMC username/password, when both keys are present.
    pub fn basic_credentials(&self) -> Option<(String, String)> {
        let username = self.data.get("username")?.clone();
        let password = self.data.get("password")?.clone();
        Some((username, password))
    }
}

/// Client-side view of the shared object store.
///
/// All mutation is compare-and-set: `update_*` submits the object together
/// with the `resource_version` the caller observed; the store accepts the
/// write only if that version is still current and bumps it on success.
/// Conflicts are surfaced as [`StoreError::Conflict`], never masked.
///
/// Deletion follows finalizer semantics: `delete_*` stamps
/// `deletion_timestamp`; the object disappears only once an `update_*`
/// leaves its finalizer list empty.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    // ── PhysicalHost ─────────────────────────────────────────────────────────

    async fn get_host(&self, key: &ObjectKey) -> Result<Option<PhysicalHost>, StoreError>;
    async fn list_hosts(&self, namespace: &str) -> Result<Vec<PhysicalHost>, StoreError>;
    async fn create_host(&self, host: &PhysicalHost) -> Result<PhysicalHost, StoreError>;
    async fn update_host(&self, host: &PhysicalHost) -> Result<PhysicalHost, StoreError>;
    async fn delete_host(&self, key: &ObjectKey) -> Result<(), StoreError>;

    // ── Beskar7Machine ───────────────────────────────────────────────────────

    async fn get_machine(&self, key: &ObjectKey) -> Result<Option<Beskar7Machine>, StoreError>;
    async fn list_machines(&self, namespace: &str) -> Result<Vec<Beskar7Machine>, StoreError>;
    async fn create_machine(&self, machine: &Beskar7Machine)
        -> Result<Beskar7Machine, StoreError>;
    async fn update_machine(&self, machine: &Beskar7Machine)
        -> Result<Beskar7Machine, StoreError>;
    async fn delete_machine(&self, key: &ObjectKey) -> Result<(), StoreError>;

    // ── Beskar7Cluster ───────────────────────────────────────────────────────

    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<Beskar7Cluster>, StoreError>;
    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Beskar7Cluster>, StoreError>;
    async fn update_cluster(&self, cluster: &Beskar7Cluster)
        -> Result<Beskar7Cluster, StoreError>;

    // ── Secrets ──────────────────────────────────────────────────────────────

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError>;

    // ── Leases ───────────────────────────────────────────────────────────────

    /// Acquire or renew the named lease for `holder`. Returns `true` when
    /// `holder` owns the lease afterwards: the lease was free, expired, or
    /// already held by this holder (renewal).
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Current holder of the named lease, if any and unexpired.
    async fn lease_holder(&self, name: &str) -> Result<Option<String>, StoreError>;

    /// Relinquish the lease if `holder` owns it. No-op otherwise.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError>;
}
