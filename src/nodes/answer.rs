//! Answer node — renders a template, streams it as a single chunk, and
//! outputs `{answer: rendered}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::dsl::NodeData;
use crate::events::NodeEvent;
use crate::nodes::{
    delegate_base, run_stream_with_events, BaseNode, NodeBuildError, NodeRunResult, WorkflowNode,
};
use crate::types::{new_var_map, ExecutionClass, NodeType};

#[derive(Clone, Debug, Deserialize)]
struct AnswerNodeData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    answer: String,
}

pub struct AnswerNode {
    base: BaseNode,
    answer: String,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: AnswerNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;
    Ok(Arc::new(AnswerNode {
        base: BaseNode::new(id, NodeType::Answer, &data.title, ExecutionClass::Response)
            .with_strategy_from(envelope),
        answer: data.answer,
    }))
}

#[async_trait]
impl WorkflowNode for AnswerNode {
    delegate_base!();

    async fn run(self: Arc<Self>, ctx: ExecutionContext) -> flume::Receiver<NodeEvent> {
        let template = self.answer.clone();
        run_stream_with_events(
            self.id().to_string(),
            self.node_type(),
            self.title().to_string(),
            move |chunks| async move {
                let rendered = ctx.variable_pool.resolve_template(&template);
                let _ = chunks.send_async(rendered.clone()).await;

                let mut outputs = new_var_map();
                outputs.insert("answer".to_string(), Value::String(rendered));
                Ok(NodeRunResult::succeeded(outputs))
            },
        )
    }
}
