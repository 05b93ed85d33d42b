use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{RedfishClient, RedfishClientFactory, RedfishConnection};
use crate::error::RedfishError;

/// Per-host client cache keyed by `{address, credentialsHash}`.
///
/// A credential rotation changes the hash, so the stale session is dropped
/// and a fresh connect happens on the next use. A failed connect is never
/// cached.
pub struct ClientCache {
    factory: Arc<dyn RedfishClientFactory>,
    clients: Mutex<HashMap<(String, String), Arc<dyn RedfishClient>>>,
}

impl ClientCache {
    pub fn new(factory: Arc<dyn RedfishClientFactory>) -> Self {
        ClientCache { factory, clients: Mutex::new(HashMap::new()) }
    }

    pub async fn get(
        &self,
        conn: &RedfishConnection,
    ) -> Result<Arc<dyn RedfishClient>, RedfishError> {
        let key = (conn.address.clone(), conn.credentials_hash());

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = self.factory.connect(conn).await?;
        // Rotated credentials leave entries for the same address behind;
        // drop them so the map stays bounded by the fleet size.
        clients.retain(|(addr, _), _| *addr != conn.address);
        debug!(address = %conn.address, "caching redfish session");
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Drop any cached session for `address`, forcing a reconnect.
    pub async fn invalidate(&self, address: &str) {
        let mut clients = self.clients.lock().await;
        clients.retain(|(addr, _), _| addr != address);
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}
