//! Service configuration from environment variables.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Which repository backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// State dies with the process; intended for tests and embedding.
    Memory,
    /// JSON files under the data directory.
    Json,
}

/// Service-level settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageKind,
    pub data_dir: PathBuf,
}

impl ServiceConfig {
    /// Load from `LOADSTORM_STORAGE` ("json" or "memory", default json)
    /// and `LOADSTORM_DATA_DIR` (default "./data").
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage = match env::var("LOADSTORM_STORAGE")
            .unwrap_or_else(|_| "json".to_string())
            .to_lowercase()
            .as_str()
        {
            "json" => StorageKind::Json,
            "memory" => StorageKind::Memory,
            other => {
                return Err(ConfigError::InvalidValue {
                    var: "LOADSTORM_STORAGE".to_string(),
                    message: format!("unknown backend '{}', use 'json' or 'memory'", other),
                })
            }
        };

        let data_dir = env::var("LOADSTORM_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        Ok(Self { storage, data_dir })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::Json,
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_when_env_unset() {
        env::remove_var("LOADSTORM_STORAGE");
        env::remove_var("LOADSTORM_DATA_DIR");

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.storage, StorageKind::Json);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[test]
    #[serial]
    fn reads_backend_and_data_dir() {
        env::set_var("LOADSTORM_STORAGE", "memory");
        env::set_var("LOADSTORM_DATA_DIR", "/tmp/loadstorm-test");

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/loadstorm-test"));

        env::remove_var("LOADSTORM_STORAGE");
        env::remove_var("LOADSTORM_DATA_DIR");
    }

    #[test]
    #[serial]
    fn rejects_unknown_backend() {
        env::set_var("LOADSTORM_STORAGE", "postgres");
        assert!(ServiceConfig::from_env().is_err());
        env::remove_var("LOADSTORM_STORAGE");
    }
}
