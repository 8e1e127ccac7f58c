use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::engine::ExecutionEngine;
use crate::errors::EngineError;
use crate::submission::{MAX_MEMORY_MB, MAX_TIMEOUT_SECS, MIN_MEMORY_MB, MIN_TIMEOUT_SECS};
use crate::syntax;
use crate::tools::{Tool, ToolMetadata};

pub const EXECUTE_DYNAMIC_CODE: &str = "execute_dynamic_code";
pub const VALIDATE_CODE: &str = "validate_code";

fn required_code(tool_name: &str, arguments: &Value) -> Result<String, EngineError> {
    arguments
        .get("code")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| EngineError::ToolError {
            tool_name: tool_name.to_string(),
            message: "Missing or invalid 'code' parameter".to_string(),
        })
}

fn optional_integer(tool_name: &str, arguments: &Value, key: &str) -> Result<Option<i64>, EngineError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| EngineError::ToolError {
                tool_name: tool_name.to_string(),
                message: format!("Parameter '{}' must be an integer", key),
            }),
    }
}

fn to_json(tool_name: &str, value: &impl serde::Serialize) -> Result<String, EngineError> {
    serde_json::to_string(value).map_err(|e| EngineError::ToolError {
        tool_name: tool_name.to_string(),
        message: format!("Failed to serialize result: {}", e),
    })
}

/// Runs Python source in a sandbox and returns the execution envelope.
pub struct ExecuteDynamicCodeTool {
    engine: Arc<ExecutionEngine>,
}

impl ExecuteDynamicCodeTool {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for ExecuteDynamicCodeTool {
    fn metadata(&self) -> ToolMetadata {
        let limits = &self.engine.config().limits;
        ToolMetadata {
            name: EXECUTE_DYNAMIC_CODE.to_string(),
            description: "Executes Python code in an isolated, resource-limited sandbox and returns its exit code, stdout and stderr".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Python source to execute"
                    },
                    "timeout_seconds": {
                        "type": "integer",
                        "description": format!("Wall-clock limit, clamped to [{}, {}]", MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
                        "default": limits.default_timeout_secs
                    },
                    "memory_limit_mb": {
                        "type": "integer",
                        "description": format!("Memory ceiling in MB, clamped to [{}, {}]", MIN_MEMORY_MB, MAX_MEMORY_MB),
                        "default": limits.default_memory_mb
                    }
                },
                "required": ["code"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> Result<String, EngineError> {
        let code = required_code(EXECUTE_DYNAMIC_CODE, &arguments)?;
        let timeout = optional_integer(EXECUTE_DYNAMIC_CODE, &arguments, "timeout_seconds")?;
        let memory = optional_integer(EXECUTE_DYNAMIC_CODE, &arguments, "memory_limit_mb")?;

        let result = self.engine.execute_dynamic_code(&code, timeout, memory).await;
        to_json(EXECUTE_DYNAMIC_CODE, &result)
    }
}

/// Syntax and static security check without execution.
pub struct ValidateCodeTool {
    engine: Arc<ExecutionEngine>,
}

impl ValidateCodeTool {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Tool for ValidateCodeTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: VALIDATE_CODE.to_string(),
            description: "Checks Python code for syntax errors and against the sandbox security rules without running it".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "Python source to check"
                    }
                },
                "required": ["code"]
            }),
        }
    }

    async fn execute(&self, arguments: Value) -> Result<String, EngineError> {
        let code = required_code(VALIDATE_CODE, &arguments)?;
        let verdict = self.engine.validate(&code);
        let syntax_error = syntax::check_syntax(&code).err();
        to_json(
            VALIDATE_CODE,
            &json!({
                "syntax_valid": syntax_error.is_none(),
                "syntax_error": syntax_error,
                "safe": verdict.is_safe(),
                "violations": verdict.violations(),
                "allowed_modules": self.engine.validator().allowed_modules(),
            }),
        )
    }
}
