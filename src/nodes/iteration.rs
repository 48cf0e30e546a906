//! Iteration node — walks a list-valued input, publishing `index`,
//! `item` and `is_last` into its own variable-pool slot for each element
//! and accumulating the elements under the declared output variable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::dsl::NodeData;
use crate::events::NodeEvent;
use crate::nodes::{
    delegate_base, run_with_events, BaseNode, NodeBuildError, NodeError, NodeRunResult,
    WorkflowNode,
};
use crate::types::{new_var_map, ExecutionClass, NodeType, VariableSelector};

const DEFAULT_MAX_ITERATIONS: usize = 100;
const DEFAULT_OUTPUT_VAR: &str = "items";

#[derive(Clone, Debug, Deserialize)]
struct IterationNodeData {
    #[serde(default)]
    title: String,
    #[serde(default, rename = "iterator")]
    iterator_var: VariableSelector,
    #[serde(default)]
    output_variable: String,
    #[serde(default)]
    max_iterations: Option<usize>,
}

pub struct IterationNode {
    base: BaseNode,
    iterator_var: VariableSelector,
    output_var: String,
    max_iterations: usize,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: IterationNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;

    let output_var = if data.output_variable.is_empty() {
        DEFAULT_OUTPUT_VAR.to_string()
    } else {
        data.output_variable
    };
    let max_iterations = data
        .max_iterations
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_ITERATIONS);

    Ok(Arc::new(IterationNode {
        base: BaseNode::new(id, NodeType::Iteration, &data.title, ExecutionClass::Container)
            .with_strategy_from(envelope),
        iterator_var: data.iterator_var,
        output_var,
        max_iterations,
    }))
}

impl IterationNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeRunResult, NodeError> {
        let Some(list_value) = ctx.variable_pool.get(&self.iterator_var) else {
            let mut outputs = new_var_map();
            outputs.insert(self.output_var.clone(), Value::Array(vec![]));
            let mut metadata = new_var_map();
            metadata.insert("iteration_count".to_string(), Value::from(0));
            metadata.insert(
                "reason".to_string(),
                Value::String("iterator variable not found".to_string()),
            );
            return Ok(NodeRunResult::succeeded(outputs).with_metadata(metadata));
        };

        let list = match list_value {
            Value::Array(list) => list,
            other => {
                let kind = match other {
                    Value::Object(_) => "object",
                    Value::String(_) => "string",
                    Value::Number(_) => "number",
                    Value::Bool(_) => "boolean",
                    _ => "null",
                };
                return Ok(NodeRunResult::failed(format!(
                    "iterator value is not iterable: expected array, got {kind}"
                )));
            }
        };

        let count = list.len().min(self.max_iterations);
        let mut accumulated = Vec::with_capacity(count);

        for (i, item) in list.into_iter().take(count).enumerate() {
            if ctx.cancellation.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            let pool = &ctx.variable_pool;
            pool.set(self.id(), "index", Value::from(i));
            pool.set(self.id(), "item", item.clone());
            pool.set(self.id(), "is_last", Value::Bool(i == count - 1));
            accumulated.push(item);
        }

        let mut outputs = new_var_map();
        outputs.insert(self.output_var.clone(), Value::Array(accumulated));
        outputs.insert("count".to_string(), Value::from(count));
        if count > 0 {
            outputs.insert("index".to_string(), Value::from(count - 1));
        }

        let mut metadata = new_var_map();
        metadata.insert("iteration_count".to_string(), Value::from(count));

        Ok(NodeRunResult::succeeded(outputs).with_metadata(metadata))
    }
}

#[async_trait]
impl WorkflowNode for IterationNode {
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

/// Container-internal entry node for iteration sub-graphs; passes through
/// with empty outputs.
pub struct IterationStartNode {
    base: BaseNode,
}

pub(crate) fn build_start(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: crate::dsl::NodeData =
        crate::dsl::NodeData::from_value(raw).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;
    Ok(Arc::new(IterationStartNode {
        base: BaseNode::new(id, NodeType::IterationStart, &data.title, ExecutionClass::Root)
            .with_strategy_from(envelope),
    }))
}

#[async_trait]
impl WorkflowNode for IterationStartNode {
    delegate_base!();

    async fn run(self: Arc<Self>, _ctx: ExecutionContext) -> flume::Receiver<NodeEvent> {
        run_with_events(
            self.id().to_string(),
            self.node_type(),
            self.title().to_string(),
            async move { Ok(NodeRunResult::succeeded(new_var_map())) },
        )
    }
}
