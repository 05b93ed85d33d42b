use std::time::Duration;

use serde::Deserialize;

/// Raw YAML representation of the optional settings file. Every field is
/// optional; absent fields keep their resolved default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSettings {
    pub environment: Option<String>,
    #[serde(default)]
    pub redfish: RawRedfish,
    #[serde(default)]
    pub controller: RawController,
    #[serde(default)]
    pub retry: RawRetry,
    #[serde(default)]
    pub boot: RawBoot,
    #[serde(default)]
    pub queue: RawQueue,
    #[serde(default)]
    pub leader: RawLeader,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRedfish {
    pub scheme: Option<String>,
    pub port: Option<u16>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawController {
    #[serde(default, with = "humantime_serde::option")]
    pub requeue_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub requeue_after_error: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub requeue_after_no_host: Option<Duration>,
    pub max_concurrent_reconciles: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRetry {
    #[serde(default, with = "humantime_serde::option")]
    pub initial_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub max_interval: Option<Duration>,
    pub multiplier: Option<f64>,
    pub max_attempts: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub max_elapsed_time: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBoot {
    pub default_efi_path: Option<String>,
    pub override_enabled: Option<String>,
    pub override_target: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawQueue {
    pub max_concurrent_global: Option<usize>,
    pub max_concurrent_per_bmc: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    pub bmc_cooldown: Option<Duration>,
    pub max_queue_depth: Option<usize>,
    #[serde(default, with = "humantime_serde::option")]
    pub dispatch_timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLeader {
    pub lease_name: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub lease_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub renew_deadline: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub retry_period: Option<Duration>,
}
