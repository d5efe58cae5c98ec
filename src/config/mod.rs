//! Application configuration.
//!
//! Aggregates configuration for every data-plane component into a single
//! Config struct that can be loaded from YAML files or environment variables.

mod pool;
mod queue;

pub use pool::{IngressConfig, PoolConfig, TargetsSourceConfig};
pub use queue::{QueueConfig, QueueType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CELLBROKER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CELLBROKER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CELLBROKER_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the targets snapshot comes from.
    pub targets: TargetsSourceConfig,
    /// Queue service backend.
    pub queue: QueueConfig,
    /// Pool consuming tenant decouple queues.
    pub fanout: PoolConfig,
    /// Pool consuming per-target retry queues.
    pub retry: PoolConfig,
    /// Decouple router settings.
    pub ingress: IngressConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.queue_type == QueueType::Pubsub && self.queue.project_id.is_empty() {
            return Err(ConfigError::Invalid(
                "queue.project_id is required for the pubsub backend".to_string(),
            ));
        }
        if self.targets.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "targets.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
