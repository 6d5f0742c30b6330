//! Runtime settings for the configuration manager

use serde::{Deserialize, Serialize};

/// Main configuration-admin settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigAdminConfig {
    /// Delivery queue settings
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Dynamic binding settings
    #[serde(default)]
    pub bindings: BindingConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Delivery queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Name of the configuration update queue, used in log output
    #[serde(default = "default_update_queue")]
    pub update_queue_name: String,

    /// Name of the event notification queue
    #[serde(default = "default_event_queue")]
    pub event_queue_name: String,

    /// How long shutdown waits for a running task before aborting it
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            update_queue_name: default_update_queue(),
            event_queue_name: default_event_queue(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Dynamic binding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Reserved PID the dynamic binding map is persisted under
    #[serde(default = "default_store_pid")]
    pub store_pid: String,

    /// Drop bindings to owners that no longer exist when starting
    #[serde(default = "default_true")]
    pub prune_on_start: bool,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            store_pid: default_store_pid(),
            prune_on_start: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_update_queue() -> String {
    "cm-configuration-updater".to_string()
}

fn default_event_queue() -> String {
    "cm-event-dispatcher".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5_000
}

fn default_store_pid() -> String {
    "config-admin.dynamic-bindings".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ConfigAdminConfig {
    /// Load settings from defaults, an optional file and `CONFIG_ADMIN_*`
    /// environment variables (nested keys separated by `__`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ConfigAdminConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CONFIG_ADMIN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
