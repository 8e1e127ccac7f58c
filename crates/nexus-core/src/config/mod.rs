//! Configuration module for the execution engine
//!
//! Configuration is a single YAML document with one section per subsystem
//! (limits, container, local, selector, validator, logging).

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::EngineError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
    ConfigLoader::from_file(path).await
}
