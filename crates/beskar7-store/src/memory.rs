use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beskar7_domain::{Beskar7Cluster, Beskar7Machine, ObjectKey, ObjectMeta, PhysicalHost};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{ObjectStore, Secret};

trait Stored: Clone {
    const KIND: &'static str;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

impl Stored for PhysicalHost {
    const KIND: &'static str = "physicalhost";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for Beskar7Machine {
    const KIND: &'static str = "beskar7machine";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for Beskar7Cluster {
    const KIND: &'static str = "beskar7cluster";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    hosts: HashMap<ObjectKey, PhysicalHost>,
    machines: HashMap<ObjectKey, Beskar7Machine>,
    clusters: HashMap<ObjectKey, Beskar7Cluster>,
    secrets: HashMap<ObjectKey, Secret>,
    leases: HashMap<String, LeaseRecord>,
    /// Monotonic across every accepted write, like an apiserver revision.
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn create<T: Stored>(
        map_revision: &mut u64,
        map: &mut HashMap<ObjectKey, T>,
        obj: &T,
    ) -> Result<T, StoreError> {
        let key = obj.meta().key();
        if map.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: T::KIND, key });
        }
        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(Uuid::new_v4());
        }
        *map_revision += 1;
        meta.resource_version = *map_revision;
        map.insert(key, stored.clone());
        Ok(stored)
    }

    fn update<T: Stored>(
        map_revision: &mut u64,
        map: &mut HashMap<ObjectKey, T>,
        obj: &T,
    ) -> Result<T, StoreError> {
        let key = obj.meta().key();
        let current = map
            .get(&key)
            .ok_or(StoreError::NotFound { kind: T::KIND, key: key.clone() })?;

        let observed = obj.meta().resource_version;
        let current_version = current.meta().resource_version;
        if observed != current_version {
            return Err(StoreError::Conflict { key, observed, current: current_version });
        }

        let mut stored = obj.clone();
        {
            let meta = stored.meta_mut();
            // uid and deletion timestamp are store-owned once set.
            meta.uid = current.meta().uid;
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = current.meta().deletion_timestamp;
            }
            *map_revision += 1;
            meta.resource_version = *map_revision;
        }

        if stored.meta().is_deleting() && stored.meta().finalizers.is_empty() {
            map.remove(&key);
        } else {
            map.insert(key, stored.clone());
        }
        Ok(stored)
    }

    fn delete<T: Stored>(
        map_revision: &mut u64,
        map: &mut HashMap<ObjectKey, T>,
        key: &ObjectKey,
    ) -> Result<(), StoreError> {
        let (has_finalizers, already_stamped) = match map.get(key) {
            Some(current) => (
                !current.meta().finalizers.is_empty(),
                current.meta().deletion_timestamp.is_some(),
            ),
            None => return Err(StoreError::NotFound { kind: T::KIND, key: key.clone() }),
        };
        if !has_finalizers {
            map.remove(key);
            return Ok(());
        }
        if !already_stamped {
            if let Some(current) = map.get_mut(key) {
                let meta = current.meta_mut();
                meta.deletion_timestamp = Some(Utc::now());
                *map_revision += 1;
                meta.resource_version = *map_revision;
            }
        }
        Ok(())
    }
}

/// In-memory implementation of [`ObjectStore`].
///
/// All data is lost on process exit. Backs tests and the standalone manager
/// mode; a real deployment substitutes the external store client.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret. Secrets have no controller of their own here.
    pub async fn put_secret(&self, secret: Secret) {
        let mut guard = self.inner.write().await;
        let rev = guard.next_revision();
        let mut secret = secret;
        secret.metadata.resource_version = rev;
        guard.secrets.insert(secret.metadata.key(), secret);
    }
}

macro_rules! list_namespace {
    ($guard:expr, $field:ident, $namespace:expr) => {{
        let mut items: Vec<_> = $guard
            .$field
            .values()
            .filter(|o| o.metadata.namespace == $namespace)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }};
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_host(&self, key: &ObjectKey) -> Result<Option<PhysicalHost>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.hosts.get(key).cloned())
    }

    async fn list_hosts(&self, namespace: &str) -> Result<Vec<PhysicalHost>, StoreError> {
        let guard = self.inner.read().await;
        list_namespace!(guard, hosts, namespace)
    }

    async fn create_host(&self, host: &PhysicalHost) -> Result<PhysicalHost, StoreError> {
        let mut guard = self.inner.write().await;
        let Inner { revision, hosts, .. } = &mut *guard;
        Inner::create(revision, hosts, host)
    }

    async fn update_host(&self, host: &PhysicalHost) -> Result<PhysicalHost, StoreError> {
        let mut guard = self.inner.write().await;
        let Inner { revision, hosts, .. } = &mut *guard;
        Inner::update(revision, hosts, host)
    }

    async fn delete_host(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let Inner { revision, hosts, .. } = &mut *guard;
        Inner::delete(revision, hosts, key)
    }

    async fn get_machine(&self, key: &ObjectKey) -> Result<Option<Beskar7Machine>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.machines.get(key).cloned())
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Beskar7Machine>, StoreError> {
        let guard = self.inner.read().await;
        list_namespace!(guard, machines, namespace)
    }

    async fn create_machine(
        &self,
        machine: &Beskar7Machine,
    ) -> Result<Beskar7Machine, StoreError> {
        let mut guard = self.inner.write().await;
        let Inner { revision, machines, .. } = &mut *guard;
        Inner::create(revision, machines, machine)
    }

    async fn update_machine(
        &self,
        machine: &Beskar7Machine,
    ) -> Result<Beskar7Machine, StoreError> {
        let mut guard = self.inner.write().await;
        let Inner { revision, machines, .. } = &mut *guard;
        Inner::update(revision, machines, machine)
    }

    async fn delete_machine(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let Inner { revision, machines, .. } = &mut *guard;
        Inner::delete(revision, machines, key)
    }

    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<Beskar7Cluster>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.clusters.get(key).cloned())
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Beskar7Cluster>, StoreError> {
        let guard = self.inner.read().await;
        list_namespace!(guard, clusters, namespace)
    }

    async fn update_cluster(
        &self,
        cluster: &Beskar7Cluster,
    ) -> Result<Beskar7Cluster, StoreError> {
        let mut guard = self.inner.write().await;
        let Inner { revision, clusters, .. } = &mut *guard;
        if clusters.contains_key(&cluster.metadata.key()) {
            Inner::update(revision, clusters, cluster)
        } else {
            Inner::create(revision, clusters, cluster)
        }
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.secrets.get(key).cloned())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Internal(format!("lease ttl out of range: {e}")))?;

        match guard.leases.get_mut(name) {
            Some(rec) if rec.holder == holder => {
                rec.expires_at = expires_at;
                Ok(true)
            }
            Some(rec) if rec.expires_at <= now => {
                rec.holder = holder.to_string();
                rec.expires_at = expires_at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                guard
                    .leases
                    .insert(name.to_string(), LeaseRecord { holder: holder.to_string(), expires_at });
                Ok(true)
            }
        }
    }

    async fn lease_holder(&self, name: &str) -> Result<Option<String>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .leases
            .get(name)
            .filter(|rec| rec.expires_at > Utc::now())
            .map(|rec| rec.holder.clone()))
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if guard.leases.get(name).map_or(false, |rec| rec.holder == holder) {
            guard.leases.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beskar7_domain::{HostState, PhysicalHostSpec, PhysicalHostStatus, HOST_FINALIZER};

    fn dummy_host(name: &str) -> PhysicalHost {
        PhysicalHost {
            metadata: ObjectMeta::new("ns1", name),
            spec: PhysicalHostSpec {
                redfish_address: format!("https://bmc-{name}"),
                credentials_ref: format!("{name}-credentials"),
                insecure_skip_verify: false,
                consumer_ref: None,
                boot_iso_source: None,
                user_data_ref: None,
            },
            status: PhysicalHostStatus::default(),
        }
    }

    #[tokio::test]
    async fn create_assigns_uid_and_version() {
        let store = InMemoryStore::new();
        let created = store.create_host(&dummy_host("h1")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version > 0);
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let store = InMemoryStore::new();
        store.create_host(&dummy_host("h1")).await.unwrap();
        let err = store.create_host(&dummy_host("h1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_with_current_version_is_accepted() {
        let store = InMemoryStore::new();
        let mut host = store.create_host(&dummy_host("h1")).await.unwrap();
        host.status.state = HostState::Enrolling;
        let updated = store.update_host(&host).await.unwrap();
        assert!(updated.metadata.resource_version > host.metadata.resource_version);
        assert_eq!(updated.status.state, HostState::Enrolling);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = InMemoryStore::new();
        let host = store.create_host(&dummy_host("h1")).await.unwrap();

        // Writer A succeeds, writer B still holds the old version.
        let mut a = host.clone();
        a.status.state = HostState::Enrolling;
        store.update_host(&a).await.unwrap();

        let mut b = host;
        b.status.state = HostState::Error;
        let err = store.update_host(&b).await.unwrap_err();
        assert!(err.is_conflict());

        // The accepted write is intact.
        let current = store.get_host(&ObjectKey::new("ns1", "h1")).await.unwrap().unwrap();
        assert_eq!(current.status.state, HostState::Enrolling);
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let store = InMemoryStore::new();
        let mut host = dummy_host("h1");
        host.metadata.add_finalizer(HOST_FINALIZER);
        let host = store.create_host(&host).await.unwrap();
        let key = host.key();

        store.delete_host(&key).await.unwrap();
        let pending = store.get_host(&key).await.unwrap().unwrap();
        assert!(pending.metadata.is_deleting(), "object must linger while finalized");

        let mut released = pending;
        released.metadata.remove_finalizer(HOST_FINALIZER);
        store.update_host(&released).await.unwrap();
        assert!(store.get_host(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_without_finalizers_removes_immediately() {
        let store = InMemoryStore::new();
        let host = store.create_host(&dummy_host("h1")).await.unwrap();
        store.delete_host(&host.key()).await.unwrap();
        assert!(store.get_host(&host.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_namespace_scoped_and_sorted() {
        let store = InMemoryStore::new();
        store.create_host(&dummy_host("h2")).await.unwrap();
        store.create_host(&dummy_host("h1")).await.unwrap();
        let mut other = dummy_host("h3");
        other.metadata.namespace = "ns2".into();
        store.create_host(&other).await.unwrap();

        let listed = store.list_hosts("ns1").await.unwrap();
        let names: Vec<_> = listed.iter().map(|h| h.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn lease_exclusion_and_renewal() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(15);

        assert!(store.try_acquire_lease("claim", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("claim", "b", ttl).await.unwrap());
        // Same holder renews.
        assert!(store.try_acquire_lease("claim", "a", ttl).await.unwrap());
        assert_eq!(store.lease_holder("claim").await.unwrap().as_deref(), Some("a"));

        store.release_lease("claim", "a").await.unwrap();
        assert!(store.try_acquire_lease("claim", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = InMemoryStore::new();
        assert!(store
            .try_acquire_lease("claim", "a", Duration::from_secs(0))
            .await
            .unwrap());
        assert_eq!(store.lease_holder("claim").await.unwrap(), None);
        assert!(store
            .try_acquire_lease("claim", "b", Duration::from_secs(15))
            .await
            .unwrap());
    }
}
