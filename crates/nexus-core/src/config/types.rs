//! Configuration type definitions for the execution engine
//!
//! Every section is optional in YAML; missing fields fall back to the
//! defaults below so an empty document yields a working engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u64,
    /// Extra time allowed past the timeout for kill and log drain.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Per stream cap on captured output.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            default_memory_mb: default_memory_mb(),
            grace_period_secs: default_grace_period_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_source_bytes: default_max_source_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_base_image")]
    pub base_image: String,
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
    /// Fraction of one core granted to a unit.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default = "default_scratch_size_mb")]
    pub scratch_size_mb: u64,
    #[serde(default = "default_run_as_user")]
    pub run_as_user: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_image: default_base_image(),
            image_prefix: default_image_prefix(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
            scratch_size_mb: default_scratch_size_mb(),
            run_as_user: default_run_as_user(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Address space granted on top of the memory ceiling so the interpreter
    /// itself can start.
    #[serde(default = "default_address_space_headroom_mb")]
    pub address_space_headroom_mb: u64,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    /// Parent of the per-call working directories; the system temp dir when unset.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: default_interpreter(),
            address_space_headroom_mb: default_address_space_headroom_mb(),
            max_open_files: default_max_open_files(),
            max_file_size_mb: default_max_file_size_mb(),
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidatorConfig {
    /// Modules admitted on top of the built-in allow-list. Entries that are
    /// on the deny-list stay denied.
    #[serde(default)]
    pub extra_allowed_modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.limits.max_output_bytes == 0 {
            return Err(EngineError::ConfigError(
                "limits.max_output_bytes must be greater than zero".to_string(),
            ));
        }
        if self.limits.max_source_bytes == 0 {
            return Err(EngineError::ConfigError(
                "limits.max_source_bytes must be greater than zero".to_string(),
            ));
        }
        if !(self.container.cpu_limit > 0.0) {
            return Err(EngineError::ConfigError(format!(
                "container.cpu_limit must be positive, got {}",
                self.container.cpu_limit
            )));
        }
        if self.container.pids_limit <= 0 {
            return Err(EngineError::ConfigError(
                "container.pids_limit must be positive".to_string(),
            ));
        }
        if self.container.base_image.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "container.base_image must not be empty".to_string(),
            ));
        }
        if self.container.image_prefix.trim().is_empty()
            || self.container.image_prefix.chars().any(|c| c.is_ascii_uppercase() || c == ':')
        {
            return Err(EngineError::ConfigError(format!(
                "container.image_prefix '{}' is not a valid repository name",
                self.container.image_prefix
            )));
        }
        if self.local.interpreter.trim().is_empty() {
            return Err(EngineError::ConfigError(
                "local.interpreter must not be empty".to_string(),
            ));
        }
        if self.selector.probe_timeout_secs == 0 {
            return Err(EngineError::ConfigError(
                "selector.probe_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if !self.container.enabled && !self.local.enabled {
            log::warn!("Both execution backends are disabled; every submission will report backend_unavailable");
        }
        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_timeout_secs() -> u64 { 60 }
fn default_memory_mb() -> u64 { 128 }
fn default_grace_period_secs() -> u64 { 2 }
fn default_max_output_bytes() -> usize { 1024 * 1024 }
fn default_max_source_bytes() -> usize { 256 * 1024 }
fn default_base_image() -> String { "python:3.12-slim".to_string() }
fn default_image_prefix() -> String { "nexus-sandbox".to_string() }
fn default_cpu_limit() -> f64 { 0.5 }
fn default_pids_limit() -> i64 { 64 }
fn default_scratch_size_mb() -> u64 { 16 }
fn default_run_as_user() -> String { "10001:10001".to_string() }
fn default_interpreter() -> String { "python3".to_string() }
fn default_address_space_headroom_mb() -> u64 { 64 }
fn default_max_open_files() -> u64 { 32 }
fn default_max_file_size_mb() -> u64 { 16 }
fn default_probe_interval_secs() -> u64 { 30 }
fn default_probe_timeout_secs() -> u64 { 3 }
fn default_log_level() -> String { "info".to_string() }
