//! Function node — executes a locally-registered function under a strict
//! I/O schema and a deadline.
//!
//! Failures are reported through a typed code taxonomy so callers can
//! distinguish config mistakes, missing bindings, type mismatches,
//! timeouts and execution failures.

mod registry;
mod validator;

pub use registry::{FunctionError, FunctionRegistry, LocalFunction};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::context::ExecutionContext;
use crate::dsl::NodeData;
use crate::events::NodeEvent;
use crate::nodes::{
    delegate_base, run_with_events, BaseNode, NodeBuildError, NodeError, NodeRunResult,
    WorkflowNode,
};
use crate::types::{new_var_map, ExecutionClass, NodeType, VariableSelector};

const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Failure classes of the function node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionErrorCode {
    InvalidConfig,
    FunctionNotFound,
    InputMissing,
    InputTypeMismatch,
    ExecTimeout,
    ExecFailed,
    OutputMissing,
    OutputTypeMismatch,
    StrictSchemaViolation,
}

impl FunctionErrorCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionErrorCode::InvalidConfig => "FUNC_NODE_INVALID_CONFIG",
            FunctionErrorCode::FunctionNotFound => "FUNC_NODE_FUNCTION_NOT_FOUND",
            FunctionErrorCode::InputMissing => "FUNC_NODE_INPUT_MISSING",
            FunctionErrorCode::InputTypeMismatch => "FUNC_NODE_INPUT_TYPE_MISMATCH",
            FunctionErrorCode::ExecTimeout => "FUNC_NODE_EXEC_TIMEOUT",
            FunctionErrorCode::ExecFailed => "FUNC_NODE_EXEC_FAILED",
            FunctionErrorCode::OutputMissing => "FUNC_NODE_OUTPUT_MISSING",
            FunctionErrorCode::OutputTypeMismatch => "FUNC_NODE_OUTPUT_TYPE_MISMATCH",
            FunctionErrorCode::StrictSchemaViolation => "FUNC_NODE_OUTPUT_SCHEMA_VIOLATION",
        }
    }
}

impl fmt::Display for FunctionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A typed function-node failure: `[CODE] message`.
#[derive(Clone, Debug, Error)]
#[error("[{code}] {message}")]
pub struct FunctionNodeError {
    pub code: FunctionErrorCode,
    pub message: String,
}

impl FunctionNodeError {
    #[must_use]
    pub fn new(code: FunctionErrorCode, message: String) -> Self {
        FunctionNodeError { code, message }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct FunctionNodeData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    function_ref: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    strict_schema: Option<bool>,
    #[serde(default)]
    inputs: Vec<InputBinding>,
    #[serde(default)]
    outputs: Vec<OutputBinding>,
}

/// One declared function input.
#[derive(Clone, Debug, Deserialize)]
pub struct InputBinding {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub value_selector: VariableSelector,
    #[serde(default)]
    pub default: Option<Value>,
}

/// One declared function output.
#[derive(Clone, Debug, Deserialize)]
pub struct OutputBinding {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub required: bool,
}

pub struct FunctionNode {
    base: BaseNode,
    data: FunctionNodeData,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: FunctionNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;

    validator::validate_config(&data.function_ref, &data.inputs, &data.outputs)
        .map_err(|e| NodeBuildError::invalid(id, e.to_string()))?;

    Ok(Arc::new(FunctionNode {
        base: BaseNode::new(id, NodeType::Function, &data.title, ExecutionClass::Executable)
            .with_strategy_from(envelope),
        data,
    }))
}

impl FunctionNode {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.data.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    fn strict_schema(&self) -> bool {
        self.data.strict_schema.unwrap_or(true)
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeRunResult, NodeError> {
        let inputs =
            match validator::build_and_validate_inputs(&ctx.variable_pool, &self.data.inputs) {
                Ok(inputs) => inputs,
                Err(err) => return Ok(NodeRunResult::failed(err.to_string())),
            };

        let Some(function) = ctx.functions.get(&self.data.function_ref) else {
            let err = FunctionNodeError::new(
                FunctionErrorCode::FunctionNotFound,
                format!("function not found: {}", self.data.function_ref),
            );
            return Ok(NodeRunResult::failed(err.to_string()));
        };

        let started = std::time::Instant::now();
        let raw_outputs = match tokio::time::timeout(self.timeout(), function.execute(inputs.clone()))
            .await
        {
            Err(_elapsed) => {
                let err = FunctionNodeError::new(
                    FunctionErrorCode::ExecTimeout,
                    "function execution timeout".to_string(),
                );
                return Ok(NodeRunResult::failed(err.to_string()));
            }
            Ok(Err(cause)) => {
                let err = FunctionNodeError::new(
                    FunctionErrorCode::ExecFailed,
                    format!("function execution failed: {cause}"),
                );
                return Ok(NodeRunResult::failed(err.to_string()));
            }
            Ok(Ok(outputs)) => outputs,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outputs = match validator::validate_and_filter_outputs(
            raw_outputs,
            &self.data.outputs,
            self.strict_schema(),
        ) {
            Ok(outputs) => outputs,
            Err(err) => return Ok(NodeRunResult::failed(err.to_string())),
        };

        let mut metadata = new_var_map();
        metadata.insert(
            "function_ref".to_string(),
            Value::String(self.data.function_ref.clone()),
        );
        metadata.insert(
            "timeout_ms".to_string(),
            Value::from(self.timeout().as_millis() as u64),
        );
        metadata.insert("strict_schema".to_string(), Value::Bool(self.strict_schema()));
        metadata.insert("elapsed_ms".to_string(), Value::from(elapsed_ms));
        metadata.insert("input_count".to_string(), Value::from(inputs.len()));
        metadata.insert("output_count".to_string(), Value::from(outputs.len()));

        Ok(NodeRunResult::succeeded(outputs).with_metadata(metadata))
    }
}

#[async_trait]
impl WorkflowNode for FunctionNode {
    delegate_base!();

    async fn run(self: Arc<Self>, ctx: ExecutionContext) -> flume::Receiver<NodeEvent> {
        let node = self.clone();
        run_with_events(
            self.id().to_string(),
            self.node_type(),
            self.title().to_string(),
            async move { node.execute(ctx).await },
        )
    }
}
