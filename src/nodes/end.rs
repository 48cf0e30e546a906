//! End node — collects the declared output selectors into the workflow's
//! final outputs.

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

#[derive(Clone, Debug, Deserialize)]
struct EndNodeData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    outputs: Vec<OutputVariable>,
}

/// One declared workflow output.
#[derive(Clone, Debug, Deserialize)]
pub struct OutputVariable {
    pub variable: String,
    #[serde(default)]
    pub value_selector: VariableSelector,
}

pub struct EndNode {
    base: BaseNode,
    outputs: Vec<OutputVariable>,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: EndNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;
    Ok(Arc::new(EndNode {
        base: BaseNode::new(id, NodeType::End, &data.title, ExecutionClass::Response)
            .with_strategy_from(envelope),
        outputs: data.outputs,
    }))
}

impl EndNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeRunResult, NodeError> {
        let mut outputs = new_var_map();
        for out in &self.outputs {
            if let Some(value) = ctx.variable_pool.get(&out.value_selector) {
                outputs.insert(out.variable.clone(), value);
            }
        }
        Ok(NodeRunResult::succeeded(outputs))
    }
}

#[async_trait]
impl WorkflowNode for EndNode {
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
