//! Tool surface of the engine
//!
//! Tools are looked up by name in a static table and invoked with JSON
//! arguments. Each returns its result as a JSON string so a hosting server can
//! forward it unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::ExecutionEngine;
use crate::errors::EngineError;

pub mod dynamic_code;

pub use dynamic_code::{ExecuteDynamicCodeTool, ValidateCodeTool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

// Core Tool trait that all tools must implement
#[async_trait]
pub trait Tool: Send + Sync {
    fn metadata(&self) -> ToolMetadata;
    async fn execute(&self, arguments: Value) -> Result<String, EngineError>;
}

// Tool registry for managing multiple tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.metadata().name;
        self.tools.insert(name, tool);
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Metadata for every registered tool, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolMetadata> {
        let mut tools: Vec<ToolMetadata> = self.tools.values().map(|tool| tool.metadata()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Dispatch a call by tool name.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<String, EngineError> {
        let tool = self
            .get_tool(name)
            .ok_or_else(|| EngineError::UnknownTool(name.to_string()))?;
        log::debug!("Dispatching tool '{}'", name);
        tool.execute(arguments).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Tool factory for creating the engine's tools
pub struct ToolFactory;

impl ToolFactory {
    pub fn create_execute_dynamic_code(engine: Arc<ExecutionEngine>) -> Arc<dyn Tool> {
        Arc::new(ExecuteDynamicCodeTool::new(engine))
    }

    pub fn create_validate_code(engine: Arc<ExecutionEngine>) -> Arc<dyn Tool> {
        Arc::new(ValidateCodeTool::new(engine))
    }

    pub fn create_default_registry(engine: Arc<ExecutionEngine>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Self::create_execute_dynamic_code(Arc::clone(&engine)));
        registry.register_tool(Self::create_validate_code(engine));
        registry
    }
}
