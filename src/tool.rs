//! Agent tools.
//!
//! A [`Tool`] is a named capability the LLM node may invoke during its
//! agent loop. Tool descriptions handed to the model come from the DSL
//! binding, never from the implementation, so the same tool can be
//! re-described per workflow.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::provider::ToolDefinition;

#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("tool not found: {name}")]
    #[diagnostic(code(flowweave::tool::not_found))]
    NotFound { name: String },

    #[error("tool execution failed: {0}")]
    #[diagnostic(code(flowweave::tool::execution))]
    Execution(String),
}

/// A callable tool. `arguments` is the raw JSON string the model
/// produced (merged with DSL static args by the LLM node); the returned
/// string becomes the `tool`-role message content.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Fallback description; DSL bindings override it.
    fn description(&self) -> &str;

    /// JSON Schema of the arguments.
    fn parameters(&self) -> Value;

    async fn execute(&self, ctx: &ExecutionContext, arguments: &str) -> Result<String, ToolError>;
}

/// Name → tool lookup table.
#[derive(Default)]
pub struct ToolRegistry {
    tools: FxHashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        ToolRegistry::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Build provider tool definitions for the named tools, using each
    /// tool's own description. The LLM node builds its own definitions
    /// from DSL bindings instead; this is for embedders that want the
    /// implementation defaults.
    #[must_use]
    pub fn definitions(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                ToolDefinition::function(tool.name(), tool.description(), tool.parameters())
            })
            .collect()
    }

    /// Execute the named tool.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        arguments: &str,
    ) -> Result<String, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        tool.execute(ctx, arguments).await
    }
}
