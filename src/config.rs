use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::access::BuildMode;
use crate::alarm::DEFAULT_MIN_ALARM_DIFF_SECS;
use crate::logging::LoggingConfig;
use crate::queue::DEFAULT_EVENT_QUEUE_CAPACITY;
use crate::readiness::DEFAULT_INIT_EVENT_DELAY;
use crate::subscription::DEFAULT_SUBSCRIPTION_BUFFER_CAPACITY;

/// Environment variable naming the config file read by the daemon binary.
pub const CONFIG_PATH_ENV: &str = "TELEMD_CONFIG";

pub const DEFAULT_STORAGE_DIR: &str = "/data/misc/telemd";

/// Daemon configuration. Every field has a default, so `{}` is a valid file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub init_event_delay_secs: u64,
    pub min_alarm_diff_secs: u32,
    pub event_queue_capacity: usize,
    pub subscription_buffer_capacity: usize,
    pub storage_dir: PathBuf,
    pub build_mode: BuildMode,
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            init_event_delay_secs: DEFAULT_INIT_EVENT_DELAY.as_secs(),
            min_alarm_diff_secs: DEFAULT_MIN_ALARM_DIFF_SECS,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            subscription_buffer_capacity: DEFAULT_SUBSCRIPTION_BUFFER_CAPACITY,
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            build_mode: BuildMode::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::Invalid("event_queue_capacity must be positive".into()));
        }
        if self.subscription_buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "subscription_buffer_capacity must be positive".into(),
            ));
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage_dir must not be empty".into()));
        }
        Ok(())
    }

    pub fn init_event_delay(&self) -> Duration {
        Duration::from_secs(self.init_event_delay_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
