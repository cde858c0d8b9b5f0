///
/// # Engine Configuration
///
/// Parsed from TOML. Every field has a default, so an empty file (or no file
/// at all, via `EngineConfig::default()`) is a valid configuration.
///
/// ## Example tickql.toml
///
/// ```toml
/// [worker]
/// tick_ms = 50          # worker idle wake interval
/// queue_capacity = 0    # 0 = unbounded
///
/// [callbacks]
/// error_handler = "OnSQLError"
/// unknown_specifier = "skip"   # or "reject"
///
/// [logging]
/// file = "sql_log.txt"         # "" disables the file sink
/// file_level = "all"
/// console_level = "warning"
/// ```
///

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::ConfigError;
use crate::format::UnknownSpecifierPolicy;
use crate::logging::LogLevel;

pub const DEFAULT_ERROR_HANDLER: &str = "OnSQLError";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub callbacks: CallbackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub tick_ms: u64,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            queue_capacity: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallbackConfig {
    pub error_handler: String,
    pub unknown_specifier: UnknownSpecifierPolicy,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            error_handler: DEFAULT_ERROR_HANDLER.to_string(),
            unknown_specifier: UnknownSpecifierPolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub file: String,
    pub file_level: LogLevel,
    pub console_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: "sql_log.txt".to_string(),
            file_level: LogLevel::All,
            console_level: LogLevel::Warning,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "worker.tick_ms must be at least 1".to_string(),
            ));
        }
        if self.callbacks.error_handler.is_empty() {
            return Err(ConfigError::Invalid(
                "callbacks.error_handler must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
