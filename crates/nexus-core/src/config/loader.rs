//! Configuration loader for YAML files

use crate::config::types::EngineConfig;
use crate::errors::EngineError;
use std::path::Path;
use tokio::fs;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_str(content: &str) -> Result<EngineConfig, EngineError> {
        // An empty document is a valid "all defaults" configuration.
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                EngineError::ConfigError(format!("Failed to parse configuration: {}", e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from an optional path, falling back to defaults
    pub async fn load_or_default(path: Option<&Path>) -> Result<EngineConfig, EngineError> {
        match path {
            Some(path) => Self::from_file(path).await,
            None => {
                log::debug!("No configuration file given, using defaults");
                Ok(EngineConfig::default())
            }
        }
    }
}
