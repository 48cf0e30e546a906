//! Start node — the workflow entry point.
//!
//! Copies its declared input variables from the `sys` namespace (or from
//! declared defaults) into its own output map.

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
use crate::vars::SYS_NODE_ID;

#[derive(Clone, Debug, Deserialize)]
struct StartNodeData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    variables: Vec<VariableDecl>,
}

/// One declared workflow input.
#[derive(Clone, Debug, Deserialize)]
pub struct VariableDecl {
    pub variable: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub var_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

pub struct StartNode {
    base: BaseNode,
    variables: Vec<VariableDecl>,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: StartNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;
    Ok(Arc::new(StartNode {
        base: BaseNode::new(id, NodeType::Start, &data.title, ExecutionClass::Root)
            .with_strategy_from(envelope),
        variables: data.variables,
    }))
}

impl StartNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeRunResult, NodeError> {
        let mut outputs = new_var_map();
        for decl in &self.variables {
            let selector = VariableSelector::new(SYS_NODE_ID, &decl.variable);
            if let Some(value) = ctx.variable_pool.get(&selector) {
                outputs.insert(decl.variable.clone(), value);
            } else if let Some(default) = &decl.default {
                outputs.insert(decl.variable.clone(), default.clone());
            }
        }
        Ok(NodeRunResult::succeeded(outputs))
    }
}

#[async_trait]
impl WorkflowNode for StartNode {
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
