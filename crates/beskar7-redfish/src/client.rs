use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beskar7_domain::PowerState;

use crate::error::RedfishError;

/// Connection parameters for one BMC, assembled by the host reconciler from
/// the host spec and its credentials secret.
#[derive(Debug, Clone)]
pub struct RedfishConnection {
    /// Base URL, e.g. `https://10.0.0.5`.
    pub address: String,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
    pub timeout: Duration,
}

impl RedfishConnection {
    /// Cache key component: a digest of the credential material, so a
    /// rotated password yields a fresh client without leaking the secret
    /// into the key itself.
    pub fn credentials_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.username.as_bytes());
        hasher.update([0]);
        hasher.update(self.password.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// System identity and sizing facts read during enrollment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub memory_mib: u64,
    pub cpu_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    Reset,
}

impl PowerAction {
    /// Redfish `ResetType` value.
    pub fn reset_type(self) -> &'static str {
        match self {
            PowerAction::On => "On",
            PowerAction::Off => "ForceOff",
            PowerAction::Reset => "ForceRestart",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VirtualMediaStatus {
    pub inserted: bool,
    pub image: Option<String>,
}

/// One-shot boot override written before power-on.
#[derive(Debug, Clone, PartialEq)]
pub struct BootSourceOverride {
    /// `Once` unless overridden by configuration.
    pub enabled: String,
    /// `UefiTarget` unless overridden by configuration.
    pub target: String,
    /// EFI bootloader path on the mounted media.
    pub uefi_target: String,
}

/// Capability set the provisioning core needs from a BMC. One instance per
/// host; per-host serialization is provided by the queue's per-BMC cap, so
/// implementations need not be internally synchronized beyond `Send + Sync`.
#[async_trait]
pub trait RedfishClient: Send + Sync + 'static {
    async fn get_system_info(&self) -> Result<SystemInfo, RedfishError>;

    async fn get_power_state(&self) -> Result<PowerState, RedfishError>;

    async fn set_power_state(&self, action: PowerAction) -> Result<(), RedfishError>;

    async fn insert_virtual_media(&self, image_url: &str) -> Result<(), RedfishError>;

    async fn eject_virtual_media(&self) -> Result<(), RedfishError>;

    async fn get_virtual_media(&self) -> Result<VirtualMediaStatus, RedfishError>;

    async fn set_boot_source_override(
        &self,
        boot: &BootSourceOverride,
    ) -> Result<(), RedfishError>;

    /// Vendor path for `RemoteConfig` mode: write a BIOS attribute (e.g.
    /// `KernelArgs`) carrying the config URL.
    async fn set_bios_attribute(&self, name: &str, value: &str) -> Result<(), RedfishError>;
}

/// Constructor seam so controllers can be exercised against fakes.
#[async_trait]
pub trait RedfishClientFactory: Send + Sync + 'static {
    /// Establish a session: reachable endpoint, accepted credentials, and a
    /// resolvable `ComputerSystem`. Failure here is what surfaces as the
    /// `RedfishConnectionFailed` condition.
    async fn connect(
        &self,
        conn: &RedfishConnection,
    ) -> Result<Arc<dyn RedfishClient>, RedfishError>;
}
