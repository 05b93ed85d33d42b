use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conditions::Condition;

/// Finalizer placed on every PhysicalHost under management.
pub const HOST_FINALIZER: &str = "physicalhost.infrastructure.beskar7.io";

/// Finalizer placed on every Beskar7Machine under management.
pub const MACHINE_FINALIZER: &str = "beskar7machine.infrastructure.beskar7.io";

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Namespaced key of a stored object. The store, the queue, and the
/// controllers all address resources by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectKey { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ── Object metadata ──────────────────────────────────────────────────────────

/// Store-managed metadata carried by every persisted resource.
///
/// `uid` is assigned on create; `resource_version` is bumped by the store on
/// every accepted write and is the token compared by CAS updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectMeta {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

// ── Host lifecycle ───────────────────────────────────────────────────────────

/// Lifecycle state of a [`PhysicalHost`]. Legal transitions are defined in
/// [`crate::host_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HostState {
    /// Freshly created, not yet observed by any controller.
    #[default]
    #[serde(rename = "")]
    None,
    Enrolling,
    Available,
    Claimed,
    Provisioning,
    Provisioned,
    Deprovisioning,
    Error,
    Unknown,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostState::None => "None",
            HostState::Enrolling => "Enrolling",
            HostState::Available => "Available",
            HostState::Claimed => "Claimed",
            HostState::Provisioning => "Provisioning",
            HostState::Provisioned => "Provisioned",
            HostState::Deprovisioning => "Deprovisioning",
            HostState::Error => "Error",
            HostState::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

/// Power state as last observed through Redfish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerState {
    On,
    Off,
    PoweringOn,
    PoweringOff,
    #[default]
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::On => "On",
            PowerState::Off => "Off",
            PowerState::PoweringOn => "PoweringOn",
            PowerState::PoweringOff => "PoweringOff",
            PowerState::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

// ── PhysicalHost ─────────────────────────────────────────────────────────────

/// Back-reference from a host to the machine that claimed it.
///
/// Single ownership: at any instant at most one machine's ref may appear on
/// a given host, enforced by the store-level CAS on bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub namespace: String,
    pub name: String,
    pub uid: Uuid,
}

impl std::fmt::Display for ConsumerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHostSpec {
    /// Redfish endpoint of the BMC, e.g. `https://10.0.0.5`.
    pub redfish_address: String,
    /// Name of the secret holding the BMC username/password.
    pub credentials_ref: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_ref: Option<ConsumerRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_iso_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_ref: Option<String>,
}

/// Hardware facts fetched from the BMC during enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareDetails {
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub cpu_count: u32,
}

impl HardwareDetails {
    /// Ranking score used by host selection. Larger is better.
    pub fn score(&self) -> u64 {
        self.memory_mib + u64::from(self.cpu_count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHostStatus {
    #[serde(default)]
    pub state: HostState,
    #[serde(default)]
    pub observed_power_state: PowerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_details: Option<HardwareDetails>,
    /// Addresses reported for the provisioned system, copied onto the
    /// owning machine once the host reaches `Provisioned`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalHost {
    pub metadata: ObjectMeta,
    pub spec: PhysicalHostSpec,
    #[serde(default)]
    pub status: PhysicalHostStatus,
}

impl PhysicalHost {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// True when the host can be offered to a claimant.
    pub fn is_available(&self) -> bool {
        self.status.state == HostState::Available
            && self.spec.consumer_ref.is_none()
            && !self.metadata.is_deleting()
    }

    /// True when `machine_uid` is the recorded consumer of this host.
    pub fn is_consumed_by(&self, machine_uid: Uuid) -> bool {
        self.spec
            .consumer_ref
            .as_ref()
            .map_or(false, |r| r.uid == machine_uid)
    }
}

// ── Beskar7Machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsFamily {
    #[serde(rename = "kairos")]
    Kairos,
    #[serde(rename = "talos")]
    Talos,
    #[serde(rename = "flatcar")]
    Flatcar,
    #[serde(rename = "LeapMicro")]
    LeapMicro,
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OsFamily::Kairos => "kairos",
            OsFamily::Talos => "talos",
            OsFamily::Flatcar => "flatcar",
            OsFamily::LeapMicro => "LeapMicro",
        };
        write!(f, "{}", s)
    }
}

/// How the boot image is parameterized.
///
/// `RemoteConfig` boots a stock image and injects a config URL through the
/// BMC (boot override or BIOS attribute); `PreBakedISO` boots an image that
/// already embeds its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningMode {
    RemoteConfig,
    #[serde(rename = "PreBakedISO")]
    PreBakedIso,
}

impl std::fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningMode::RemoteConfig => write!(f, "RemoteConfig"),
            ProvisioningMode::PreBakedIso => write!(f, "PreBakedISO"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MachinePhase {
    #[default]
    Pending,
    Provisioning,
    Provisioned,
    Running,
    Deleting,
    Failed,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachinePhase::Pending => "Pending",
            MachinePhase::Provisioning => "Provisioning",
            MachinePhase::Provisioned => "Provisioned",
            MachinePhase::Running => "Running",
            MachinePhase::Deleting => "Deleting",
            MachinePhase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    Hostname,
    InternalIP,
    ExternalIP,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub os_family: OsFamily,
    #[serde(rename = "imageURL")]
    pub image_url: String,
    pub provisioning_mode: ProvisioningMode,
    #[serde(rename = "configURL", default, skip_serializing_if = "Option::is_none")]
    pub config_url: Option<String>,
    /// Set on claim; format `b7:////<namespace>/<host-name>`.
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Label selector narrowing which hosts may be claimed. Empty matches all.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub host_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default)]
    pub phase: MachinePhase,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beskar7Machine {
    pub metadata: ObjectMeta,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

impl Beskar7Machine {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Consumer reference this machine stamps onto a claimed host.
    /// Requires the store-assigned uid.
    pub fn consumer_ref(&self) -> Option<ConsumerRef> {
        self.metadata.uid.map(|uid| ConsumerRef {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
            uid,
        })
    }
}

// ── Beskar7Cluster ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl ControlPlaneEndpoint {
    pub fn is_set(&self) -> bool {
        !self.host.is_empty()
    }
}

pub fn default_failure_domain_labels() -> Vec<String> {
    vec!["topology.kubernetes.io/zone".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub control_plane_endpoint: ControlPlaneEndpoint,
    /// Label keys inspected on hosts to derive failure domains.
    #[serde(default = "default_failure_domain_labels")]
    pub failure_domain_labels: Vec<String>,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        ClusterSpec {
            control_plane_endpoint: ControlPlaneEndpoint::default(),
            failure_domain_labels: default_failure_domain_labels(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "std::collections::BTreeSet::is_empty")]
    pub failure_domains: std::collections::BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beskar7Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Beskar7Cluster {
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }
}
