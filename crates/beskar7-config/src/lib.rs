mod loader;
mod raw;
pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use loader::{apply_env_overrides, load_settings, load_settings_with, EnvLookup};
pub use settings::{
    BootSettings, ControllerSettings, Environment, LeaderSettings, QueueSettings,
    RedfishSettings, RetrySettings, Settings,
};
