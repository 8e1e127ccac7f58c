//! Error types for the execution engine
//!
//! Two layers are kept apart. `ExecutorError` describes faults raised while a
//! backend is driving a sandbox (runtime API failures, I/O, image builds); these
//! never reach a caller verbatim and are folded into a sanitized
//! `infrastructure_error` envelope by the result aggregator. `EngineError` is the
//! coarse, cloneable error used at the engine surface (configuration, tool
//! dispatch, backend selection).

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("No execution backend is available: {0}")]
    BackendUnavailable(String),
    #[error("Infrastructure error: {0}")]
    InfrastructureError(String),
    #[error("Tool execution failed for '{tool_name}': {message}")]
    ToolError { tool_name: String, message: String },
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

// Errors raised by a sandbox backend
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("I/O error during sandbox operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Isolation runtime error: {0}")]
    RuntimeError(String),
    #[error("Image build failed: {0}")]
    ImageBuildFailed(String),
    #[error("Failed to launch sandbox unit: {0}")]
    LaunchFailed(String),
    #[error("Interpreter not found: {0}")]
    InterpreterNotFound(String),
    #[error("Sandbox teardown failed: {0}")]
    TeardownFailed(String),
}

impl ExecutorError {
    /// Launch-class failures mean the isolation runtime itself misbehaved, so
    /// the cached availability verdict can no longer be trusted.
    pub fn invalidates_availability(&self) -> bool {
        matches!(
            self,
            ExecutorError::BollardError(_)
                | ExecutorError::RuntimeError(_)
                | ExecutorError::LaunchFailed(_)
                | ExecutorError::ImageBuildFailed(_)
                | ExecutorError::TeardownFailed(_)
        )
    }

    /// The sandbox may still hold a unit or image after this error.
    pub fn leaves_resources(&self) -> bool {
        matches!(self, ExecutorError::TeardownFailed(_))
    }
}
