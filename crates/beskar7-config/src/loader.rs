use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;
use crate::raw::RawSettings;
use crate::settings::{Environment, Settings};

/// Environment accessor, injectable so tests don't mutate process state.
pub type EnvLookup<'a> = dyn Fn(&str) -> Option<String> + 'a;

/// Resolve settings: compiled defaults → `BESKAR7_ENVIRONMENT` preset →
/// optional YAML file → `BESKAR7_*` variable overrides.
pub fn load_settings(file: Option<&Path>) -> Result<Settings, ConfigError> {
    let lookup = |name: &str| std::env::var(name).ok();
    load_settings_with(file, &lookup)
}

pub fn load_settings_with(
    file: Option<&Path>,
    lookup: &EnvLookup<'_>,
) -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();

    if let Some(env) = lookup("BESKAR7_ENVIRONMENT") {
        let env: Environment = env
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                name: "BESKAR7_ENVIRONMENT".to_string(),
                message,
            })?;
        settings.apply_environment(env);
    }

    if let Some(path) = file {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let raw: RawSettings =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?;
        overlay_file(&mut settings, raw)?;
        debug!(path = %path.display(), "applied settings file");
    }

    apply_env_overrides(&mut settings, lookup)?;
    Ok(settings)
}

fn overlay_file(settings: &mut Settings, raw: RawSettings) -> Result<(), ConfigError> {
    if let Some(env) = raw.environment {
        let env: Environment = env.parse().map_err(|message| ConfigError::InvalidValue {
            name: "environment".to_string(),
            message,
        })?;
        settings.apply_environment(env);
    }

    macro_rules! overlay {
        ($($section:ident . $field:ident),+ $(,)?) => {
            $(if let Some(v) = raw.$section.$field {
                settings.$section.$field = v;
            })+
        };
    }

    overlay!(
        redfish.scheme, redfish.port, redfish.timeout,
        controller.requeue_interval, controller.requeue_after_error,
        controller.requeue_after_no_host, controller.max_concurrent_reconciles,
        retry.initial_interval, retry.max_interval, retry.multiplier,
        retry.max_attempts, retry.max_elapsed_time,
        boot.default_efi_path, boot.override_enabled, boot.override_target,
        queue.max_concurrent_global, queue.max_concurrent_per_bmc,
        queue.bmc_cooldown, queue.max_queue_depth, queue.dispatch_timeout,
        queue.max_attempts,
        leader.lease_name, leader.lease_duration, leader.renew_deadline,
        leader.retry_period,
    );
    Ok(())
}

/// Apply `BESKAR7_*` variable overrides on top of `settings`.
pub fn apply_env_overrides(
    settings: &mut Settings,
    lookup: &EnvLookup<'_>,
) -> Result<(), ConfigError> {
    if let Some(v) = lookup("BESKAR7_REDFISH_SCHEME") {
        settings.redfish.scheme = v;
    }
    if let Some(v) = lookup("BESKAR7_REDFISH_PORT") {
        settings.redfish.port = parse_number("BESKAR7_REDFISH_PORT", &v)?;
    }
    if let Some(v) = lookup("BESKAR7_REDFISH_TIMEOUT") {
        settings.redfish.timeout = parse_duration("BESKAR7_REDFISH_TIMEOUT", &v)?;
    }

    if let Some(v) = lookup("BESKAR7_CONTROLLER_REQUEUE_INTERVAL") {
        settings.controller.requeue_interval =
            parse_duration("BESKAR7_CONTROLLER_REQUEUE_INTERVAL", &v)?;
    }
    if let Some(v) = lookup("BESKAR7_CONTROLLER_REQUEUE_AFTER_ERROR") {
        settings.controller.requeue_after_error =
            parse_duration("BESKAR7_CONTROLLER_REQUEUE_AFTER_ERROR", &v)?;
    }
    if let Some(v) = lookup("BESKAR7_CONTROLLER_REQUEUE_AFTER_NO_HOST") {
        settings.controller.requeue_after_no_host =
            parse_duration("BESKAR7_CONTROLLER_REQUEUE_AFTER_NO_HOST", &v)?;
    }

    if let Some(v) = lookup("BESKAR7_RETRY_INITIAL_INTERVAL") {
        settings.retry.initial_interval = parse_duration("BESKAR7_RETRY_INITIAL_INTERVAL", &v)?;
    }
    if let Some(v) = lookup("BESKAR7_RETRY_MAX_INTERVAL") {
        settings.retry.max_interval = parse_duration("BESKAR7_RETRY_MAX_INTERVAL", &v)?;
    }
    if let Some(v) = lookup("BESKAR7_RETRY_MULTIPLIER") {
        settings.retry.multiplier = parse_number("BESKAR7_RETRY_MULTIPLIER", &v)?;
    }
    if let Some(v) = lookup("BESKAR7_RETRY_MAX_ATTEMPTS") {
        settings.retry.max_attempts = parse_number("BESKAR7_RETRY_MAX_ATTEMPTS", &v)?;
    }
    if let Some(v) = lookup("BESKAR7_RETRY_MAX_ELAPSED_TIME") {
        settings.retry.max_elapsed_time = parse_duration("BESKAR7_RETRY_MAX_ELAPSED_TIME", &v)?;
    }

    if let Some(v) = lookup("BESKAR7_BOOT_DEFAULT_EFI_PATH") {
        settings.boot.default_efi_path = v;
    }
    if let Some(v) = lookup("BESKAR7_BOOT_OVERRIDE_ENABLED") {
        settings.boot.override_enabled = v;
    }
    if let Some(v) = lookup("BESKAR7_BOOT_OVERRIDE_TARGET") {
        settings.boot.override_target = v;
    }

    Ok(())
}

fn parse_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}': {e}"),
    })
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}': {e}"),
    })
}
