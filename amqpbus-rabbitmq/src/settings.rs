use serde::Deserialize;

use amqpbus_core::{MessagingError, WorkerConfig};

use crate::options::ConnectionSettings;

/// Config file read from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "amqpbus.yaml";
/// Names an additional config file.
pub const CONFIG_ENV_VAR: &str = "AMQPBUS_CONFIG";
/// Prefix of overriding env vars, e.g. `AMQPBUS__AMQP__HOST`.
pub const CONFIG_ENV_PREFIX: &str = "AMQPBUS";
/// Log filter directives for binaries.
pub const LOG_ENV_VAR: &str = "AMQPBUS_LOG";

/// Everything a worker process needs: where the broker is and who it is.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub amqp: ConnectionSettings,
    pub worker: WorkerConfig,
}

impl Settings {
    /// Load settings from files and environment.
    ///
    /// Later sources override earlier ones:
    /// 1. `amqpbus.yaml` in the current directory (if exists)
    /// 2. File given by `path` (if provided)
    /// 3. File named by `AMQPBUS_CONFIG` (if set)
    /// 4. `AMQPBUS__*` environment variables, `__` separating sections
    pub fn load(path: Option<&str>) -> Result<Self, MessagingError> {
        let settings = Self::read(path)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Same layering as [`load`](Self::load), without validation.
    pub fn read(path: Option<&str>) -> Result<Self, MessagingError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MessagingError::Config(e.to_string()))
    }

    /// Reject settings a worker could not run with.
    pub fn validate(&self) -> Result<(), MessagingError> {
        self.worker.identity()?;
        if self.amqp.prefetch == 0 {
            return Err(MessagingError::Config("amqp.prefetch must be at least 1".into()));
        }
        if self.worker.max_in_flight == 0 {
            return Err(MessagingError::Config(
                "worker.max_in_flight must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
