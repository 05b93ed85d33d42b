use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment tier selected by `BESKAR7_ENVIRONMENT`. Each tier applies a
/// preset on top of the compiled defaults; file and env overrides win over
/// both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedfishSettings {
    pub scheme: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RedfishSettings {
    fn default() -> Self {
        RedfishSettings {
            scheme: "https".to_string(),
            port: 443,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    #[serde(with = "humantime_serde")]
    pub requeue_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub requeue_after_error: Duration,
    #[serde(with = "humantime_serde")]
    pub requeue_after_no_host: Duration,
    pub max_concurrent_reconciles: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            requeue_interval: Duration::from_secs(30),
            requeue_after_error: Duration::from_secs(5 * 60),
            requeue_after_no_host: Duration::from_secs(60),
            max_concurrent_reconciles: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub max_elapsed_time: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(5 * 60),
            multiplier: 2.0,
            max_attempts: 5,
            max_elapsed_time: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootSettings {
    pub default_efi_path: String,
    pub override_enabled: String,
    pub override_target: String,
}

impl Default for BootSettings {
    fn default() -> Self {
        BootSettings {
            default_efi_path: "\\EFI\\BOOT\\BOOTX64.EFI".to_string(),
            override_enabled: "Once".to_string(),
            override_target: "UefiTarget".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub max_concurrent_global: usize,
    pub max_concurrent_per_bmc: usize,
    #[serde(with = "humantime_serde")]
    pub bmc_cooldown: Duration,
    pub max_queue_depth: usize,
    #[serde(with = "humantime_serde")]
    pub dispatch_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_concurrent_global: 10,
            max_concurrent_per_bmc: 1,
            bmc_cooldown: Duration::from_secs(30),
            max_queue_depth: 1000,
            dispatch_timeout: Duration::from_secs(5 * 60),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderSettings {
    pub lease_name: String,
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub renew_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_period: Duration,
}

impl Default for LeaderSettings {
    fn default() -> Self {
        LeaderSettings {
            lease_name: "beskar7-claim-coordinator".to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Full runtime configuration, resolved from defaults, the environment
/// preset, an optional settings file, and `BESKAR7_*` overrides, in that
/// order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    pub environment: Environment,
    pub redfish: RedfishSettings,
    pub controller: ControllerSettings,
    pub retry: RetrySettings,
    pub boot: BootSettings,
    pub queue: QueueSettings,
    pub leader: LeaderSettings,
}

impl Settings {
    /// Apply the tier preset for `env`. Development tightens pacing so a
    /// laptop loop converges quickly; staging shortens only the error
    /// requeue; production keeps the compiled defaults.
    pub fn apply_environment(&mut self, env: Environment) {
        self.environment = env;
        match env {
            Environment::Development => {
                self.controller.requeue_interval = Duration::from_secs(5);
                self.controller.requeue_after_no_host = Duration::from_secs(10);
                self.controller.requeue_after_error = Duration::from_secs(30);
                self.queue.bmc_cooldown = Duration::from_secs(5);
                self.redfish.timeout = Duration::from_secs(10);
            }
            Environment::Staging => {
                self.controller.requeue_after_error = Duration::from_secs(60);
            }
            Environment::Production => {}
        }
    }
}
