use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beskar7_domain::PowerState;

use crate::client::{
    BootSourceOverride, PowerAction, RedfishClient, RedfishClientFactory, RedfishConnection,
    SystemInfo, VirtualMediaStatus,
};
use crate::error::RedfishError;

#[derive(Debug, Default)]
struct FakeState {
    power: PowerState,
    media: VirtualMediaStatus,
    boot_override: Option<BootSourceOverride>,
    bios_attributes: HashMap<String, String>,
    operations: Vec<String>,
}

/// In-memory BMC simulator implementing [`RedfishClient`].
///
/// Mirrors real side effects: power-on flips the observed power state,
/// insert records the image. `fail_all` makes every operation return an
/// HTTP 500, for retry-path tests.
#[derive(Clone, Default)]
pub struct FakeRedfish {
    state: Arc<Mutex<FakeState>>,
    info: Arc<Mutex<SystemInfo>>,
    fail_all: Arc<AtomicBool>,
}

impl FakeRedfish {
    pub fn new(info: SystemInfo) -> Self {
        FakeRedfish {
            state: Arc::new(Mutex::new(FakeState::default())),
            info: Arc::new(Mutex::new(info)),
            fail_all: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_system_info(&self, info: SystemInfo) {
        *self.info.lock().unwrap() = info;
    }

    pub fn set_power(&self, power: PowerState) {
        self.state.lock().unwrap().power = power;
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn power(&self) -> PowerState {
        self.state.lock().unwrap().power
    }

    pub fn media(&self) -> VirtualMediaStatus {
        self.state.lock().unwrap().media.clone()
    }

    pub fn boot_override(&self) -> Option<BootSourceOverride> {
        self.state.lock().unwrap().boot_override.clone()
    }

    pub fn bios_attribute(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().bios_attributes.get(name).cloned()
    }

    /// Ordered names of the operations invoked so far.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().operations.clone()
    }

    fn check(&self, op: &str) -> Result<(), RedfishError> {
        self.state.lock().unwrap().operations.push(op.to_string());
        if self.fail_all.load(Ordering::SeqCst) {
            Err(RedfishError::Http {
                status: 500,
                path: format!("/fake/{op}"),
                message: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RedfishClient for FakeRedfish {
    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError> {
        self.check("get_system_info")?;
        Ok(self.info.lock().unwrap().clone())
    }

    async fn get_power_state(&self) -> Result<PowerState, RedfishError> {
        self.check("get_power_state")?;
        Ok(self.state.lock().unwrap().power)
    }

    async fn set_power_state(&self, action: PowerAction) -> Result<(), RedfishError> {
        self.check("set_power_state")?;
        let mut state = self.state.lock().unwrap();
        state.power = match action {
            PowerAction::On | PowerAction::Reset => PowerState::On,
            PowerAction::Off => PowerState::Off,
        };
        Ok(())
    }

    async fn insert_virtual_media(&self, image_url: &str) -> Result<(), RedfishError> {
        self.check("insert_virtual_media")?;
        let mut state = self.state.lock().unwrap();
        state.media = VirtualMediaStatus { inserted: true, image: Some(image_url.to_string()) };
        Ok(())
    }

    async fn eject_virtual_media(&self) -> Result<(), RedfishError> {
        self.check("eject_virtual_media")?;
        let mut state = self.state.lock().unwrap();
        state.media = VirtualMediaStatus::default();
        Ok(())
    }

    async fn get_virtual_media(&self) -> Result<VirtualMediaStatus, RedfishError> {
        self.check("get_virtual_media")?;
        Ok(self.state.lock().unwrap().media.clone())
    }

    async fn set_boot_source_override(
        &self,
        boot: &BootSourceOverride,
    ) -> Result<(), RedfishError> {
        self.check("set_boot_source_override")?;
        self.state.lock().unwrap().boot_override = Some(boot.clone());
        Ok(())
    }

    async fn set_bios_attribute(&self, name: &str, value: &str) -> Result<(), RedfishError> {
        self.check("set_bios_attribute")?;
        self.state
            .lock()
            .unwrap()
            .bios_attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// Factory handing out one [`FakeRedfish`] per BMC address.
#[derive(Clone, Default)]
pub struct FakeRedfishFactory {
    bmcs: Arc<Mutex<HashMap<String, FakeRedfish>>>,
    connects: Arc<AtomicUsize>,
    fail_connects: Arc<AtomicBool>,
}

impl FakeRedfishFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The simulator behind `address`, created on first use.
    pub fn bmc(&self, address: &str) -> FakeRedfish {
        self.bmcs
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RedfishClientFactory for FakeRedfishFactory {
    async fn connect(
        &self,
        conn: &RedfishConnection,
    ) -> Result<Arc<dyn RedfishClient>, RedfishError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(RedfishError::Connection {
                address: conn.address.clone(),
                message: "injected connect failure".to_string(),
            });
        }
        Ok(Arc::new(self.bmc(&conn.address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn power_and_media_side_effects() {
        let fake = FakeRedfish::default();
        assert_eq!(fake.get_power_state().await.unwrap(), PowerState::Unknown);

        fake.set_power_state(PowerAction::On).await.unwrap();
        assert_eq!(fake.get_power_state().await.unwrap(), PowerState::On);

        fake.insert_virtual_media("http://img/os.iso").await.unwrap();
        let media = fake.get_virtual_media().await.unwrap();
        assert!(media.inserted);
        assert_eq!(media.image.as_deref(), Some("http://img/os.iso"));

        fake.eject_virtual_media().await.unwrap();
        assert!(!fake.get_virtual_media().await.unwrap().inserted);
    }

    #[tokio::test]
    async fn injected_failure_has_transient_kind() {
        let fake = FakeRedfish::default();
        fake.fail_all(true);
        let err = fake.get_power_state().await.unwrap_err();
        assert_eq!(err.kind(), beskar7_domain::ErrorKind::Transient);
    }

    #[tokio::test]
    async fn factory_hands_out_one_bmc_per_address() {
        let factory = FakeRedfishFactory::new();
        let conn = RedfishConnection {
            address: "https://bmc-1".into(),
            username: "admin".into(),
            password: "pw".into(),
            insecure_skip_verify: false,
            timeout: std::time::Duration::from_secs(5),
        };
        let client = factory.connect(&conn).await.unwrap();
        client.set_power_state(PowerAction::On).await.unwrap();

        // Same simulator observable through the factory handle.
        assert_eq!(factory.bmc("https://bmc-1").power(), PowerState::On);
    }
}
