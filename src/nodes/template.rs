//! Template-transform node.
//!
//! Renders a Jinja-like template using its declared inputs, supporting
//! both `{{ var }}` locals and `{{#node.var#}}` variable-pool references.
//! Outputs `{output: rendered}`.

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
use crate::vars::template::render_with_pool;

#[derive(Clone, Debug, Deserialize)]
struct TemplateNodeData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    template: String,
    #[serde(default)]
    variables: Vec<InputVariable>,
}

/// One input binding of the template.
#[derive(Clone, Debug, Deserialize)]
pub struct InputVariable {
    pub variable: String,
    #[serde(default)]
    pub value_selector: VariableSelector,
}

pub struct TemplateNode {
    base: BaseNode,
    template: String,
    variables: Vec<InputVariable>,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: TemplateNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;
    Ok(Arc::new(TemplateNode {
        base: BaseNode::new(
            id,
            NodeType::TemplateTransform,
            &data.title,
            ExecutionClass::Executable,
        )
        .with_strategy_from(envelope),
        template: data.template,
        variables: data.variables,
    }))
}

impl TemplateNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeRunResult, NodeError> {
        let mut locals = new_var_map();
        for binding in &self.variables {
            if let Some(value) = ctx.variable_pool.get(&binding.value_selector) {
                locals.insert(binding.variable.clone(), value);
            }
        }

        let rendered = render_with_pool(&self.template, &locals, &ctx.variable_pool);

        let mut outputs = new_var_map();
        outputs.insert("output".to_string(), Value::String(rendered));
        Ok(NodeRunResult::succeeded(outputs))
    }
}

#[async_trait]
impl WorkflowNode for TemplateNode {
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
