use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Condition types.
pub const REDFISH_CONNECTION_READY: &str = "RedfishConnectionReady";
pub const HOST_PROVISIONED: &str = "HostProvisioned";
pub const MACHINE_READY: &str = "MachineReady";
pub const CONTROL_PLANE_ENDPOINT_READY: &str = "ControlPlaneEndpointReady";
pub const FAILURE_DOMAINS_READY: &str = "FailureDomainsReady";

// Condition reasons surfaced to users.
pub const REASON_WAITING_FOR_CREDENTIALS: &str = "WaitingForCredentials";
pub const REASON_REDFISH_CONNECTION_FAILED: &str = "RedfishConnectionFailed";
pub const REASON_WAITING_FOR_BOOT_INFO: &str = "WaitingForBootInfo";
pub const REASON_SET_BOOT_ISO_FAILED: &str = "SetBootISOFailed";
pub const REASON_POWER_ON_FAILED: &str = "PowerOnFailed";
pub const REASON_EJECT_MEDIA_FAILED: &str = "EjectMediaFailed";
pub const REASON_WAITING_FOR_PHYSICAL_HOST: &str = "WaitingForPhysicalHost";
pub const REASON_MISSING_CREDENTIALS: &str = "MissingCredentials";
pub const REASON_SECRET_NOT_FOUND: &str = "SecretNotFound";
pub const REASON_CLAIM_LOST: &str = "ClaimLost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One structured condition on a resource status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// Set (or update) a condition in place.
///
/// `last_transition_time` only advances when `status` actually changes, so
/// repeated writes of the same status are invisible to watchers of the
/// timestamp. Reason and message are refreshed unconditionally.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: Option<&str>,
    message: Option<&str>,
    now: DateTime<Utc>,
) {
    match conditions.iter_mut().find(|c| c.condition_type == condition_type) {
        Some(existing) => {
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = now;
            }
            existing.reason = reason.map(String::from);
            existing.message = message.map(String::from);
        }
        None => conditions.push(Condition {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.map(String::from),
            message: message.map(String::from),
            last_transition_time: now,
        }),
    }
}

pub fn get_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// True when the condition exists with status `True`.
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    get_condition(conditions, condition_type)
        .map_or(false, |c| c.status == ConditionStatus::True)
}
