//! LLM node.
//!
//! Renders its prompt templates against the variable pool, consults the
//! memory coordinator, then either streams a plain completion or enters
//! the agent loop when tool bindings are configured. After success the
//! conversation turn is memorized fire-and-forget, inheriting the tenant
//! scope, and an `llm_trace` metadata object is attached for the run
//! recorder.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::ExecutionContext;
use crate::dsl::NodeData;
use crate::events::NodeEvent;
use crate::memory::{MemorizeRequest, MemoryConfig};
use crate::message::{Message, Role};
use crate::nodes::{
    delegate_base, run_stream_with_events, BaseNode, NodeBuildError, NodeError, NodeRunResult,
    WorkflowNode,
};
use crate::provider::{CompletionRequest, ToolDefinition};
use crate::tool::ToolRegistry;
use crate::types::{new_var_map, ExecutionClass, NodeType};

/// Upper bound on agent-loop rounds.
const AGENT_ROUND_LIMIT: usize = 10;

#[derive(Clone, Debug, Deserialize)]
struct LlmNodeData {
    #[serde(default)]
    title: String,
    model: ModelConfig,
    #[serde(default)]
    prompts: Vec<PromptTemplate>,
    #[serde(default)]
    memory: Option<MemoryConfig>,
    #[serde(default)]
    tools: Vec<ToolBinding>,
}

/// Model descriptor from the DSL.
#[derive(Clone, Debug, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
}

/// One prompt template; `text` may carry `{{#node.var#}}` references.
#[derive(Clone, Debug, Deserialize)]
pub struct PromptTemplate {
    pub role: String,
    #[serde(default)]
    pub text: String,
}

/// One agent-tool binding. The description is mandatory in the DSL and
/// always overrides the tool implementation's own.
#[derive(Clone, Debug, Deserialize)]
pub struct ToolBinding {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: Option<serde_json::Map<String, Value>>,
}

pub struct LlmNode {
    base: BaseNode,
    data: LlmNodeData,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: LlmNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;

    if let Some(memory) = &data.memory {
        memory
            .validate()
            .map_err(|e| NodeBuildError::invalid(id, format!("invalid memory config: {e}")))?;
    }

    for (i, binding) in data.tools.iter().enumerate() {
        if binding.name.trim().is_empty() {
            return Err(NodeBuildError::invalid(
                id,
                format!("invalid tool binding at index {i}: name is required"),
            ));
        }
        if binding.description.trim().is_empty() {
            return Err(NodeBuildError::invalid(
                id,
                format!(
                    "invalid tool binding {:?}: description is required in DSL",
                    binding.name
                ),
            ));
        }
    }

    Ok(Arc::new(LlmNode {
        base: BaseNode::new(id, NodeType::Llm, &data.title, ExecutionClass::Executable)
            .with_strategy_from(envelope),
        data,
    }))
}

impl LlmNode {
    async fn execute(
        &self,
        ctx: ExecutionContext,
        stream: flume::Sender<String>,
    ) -> Result<NodeRunResult, NodeError> {
        let provider = ctx.providers.get(&self.data.model.provider)?;

        let mut messages = self.build_messages(&ctx);
        let user_input = extract_user_input(&messages);
        messages = self.inject_memory(&ctx, messages, &user_input).await;

        let mut tool_defs = Vec::new();
        let tool_registry = ctx.tools.clone();
        if !self.data.tools.is_empty() {
            if let Some(registry) = &tool_registry {
                tool_defs = self.build_tool_definitions(registry);
                tracing::info!(
                    node_id = %self.id(),
                    tool_count = tool_defs.len(),
                    "agent tools configured"
                );
            }
        }

        let trace_messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let call_start = Instant::now();
        let mut content = String::new();
        let mut total_tokens: u64 = 0;

        if !tool_defs.is_empty() {
            let registry = tool_registry.expect("tool registry present when defs built");
            let mut answered = false;

            for round in 0..AGENT_ROUND_LIMIT {
                let request = self.completion_request(messages.clone(), tool_defs.clone());
                let response = provider
                    .complete(request)
                    .await
                    .map_err(|e| NodeError::msg(format!("LLM complete error (round {round}): {e}")))?;
                total_tokens += u64::from(response.usage.total_tokens);

                if response.tool_calls.is_empty() {
                    content = response.content;
                    if !content.is_empty() {
                        let _ = stream.send_async(content.clone()).await;
                    }
                    tracing::info!(
                        node_id = %self.id(),
                        rounds = round + 1,
                        total_tokens,
                        "agent loop finished"
                    );
                    answered = true;
                    break;
                }

                tracing::info!(
                    node_id = %self.id(),
                    round = round + 1,
                    tool_count = response.tool_calls.len(),
                    "tool calls received"
                );

                messages.push(
                    Message::assistant(response.content.clone())
                        .with_tool_calls(response.tool_calls.clone()),
                );

                // All calls execute concurrently; results append in the
                // original call order.
                let executions = response.tool_calls.iter().map(|call| {
                    let registry = registry.clone();
                    let ctx = ctx.clone();
                    let arguments =
                        self.merge_tool_args(&call.function.name, &call.function.arguments);
                    let call = call.clone();
                    async move {
                        let result = registry
                            .execute(&ctx, &call.function.name, &arguments)
                            .await
                            .unwrap_or_else(|err| {
                                tracing::error!(
                                    tool = %call.function.name,
                                    error = %err,
                                    "tool execution failed"
                                );
                                format!("tool execution failed: {err}")
                            });
                        Message::tool_result(call.id, call.function.name, result)
                    }
                });
                messages.extend(join_all(executions).await);
            }

            if !answered {
                return Err(NodeError::msg(format!(
                    "exceeded safety limit ({AGENT_ROUND_LIMIT}) for tool call rounds"
                )));
            }
        } else {
            let request = self.completion_request(messages.clone(), Vec::new());
            let (chunk_rx, err_rx) = provider.stream_complete(request).await?;

            loop {
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
                    chunk = chunk_rx.recv_async() => match chunk {
                        Ok(chunk) => {
                            if !chunk.delta.is_empty() {
                                content.push_str(&chunk.delta);
                                let _ = stream.send_async(chunk.delta).await;
                            }
                        }
                        Err(_) => break,
                    },
                }
            }
            if let Ok(err) = err_rx.try_recv() {
                return Err(NodeError::msg(format!("LLM stream error: {err}")));
            }
        }

        let elapsed_ms = call_start.elapsed().as_millis() as u64;

        self.save_memory(&ctx, user_input, content.clone());

        let mut outputs = new_var_map();
        outputs.insert("text".to_string(), Value::String(content.clone()));

        let mut metadata = new_var_map();
        metadata.insert(
            "provider".to_string(),
            Value::String(self.data.model.provider.clone()),
        );
        metadata.insert("model".to_string(), Value::String(self.data.model.name.clone()));
        metadata.insert("total_tokens".to_string(), Value::from(total_tokens));
        metadata.insert(
            "llm_trace".to_string(),
            json!({
                "provider": self.data.model.provider,
                "model": self.data.model.name,
                "messages": trace_messages,
                "temperature": self.data.model.temperature,
                "max_tokens": self.data.model.max_tokens,
                "top_p": self.data.model.top_p,
                "response": content,
                "elapsed_ms": elapsed_ms,
            }),
        );

        Ok(NodeRunResult::succeeded(outputs).with_metadata(metadata))
    }

    fn completion_request(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> CompletionRequest {
        let tool_choice = (!tools.is_empty()).then(|| "auto".to_string());
        CompletionRequest {
            model: self.data.model.name.clone(),
            messages,
            temperature: self.data.model.temperature,
            max_tokens: self.data.model.max_tokens,
            top_p: self.data.model.top_p,
            stop: Vec::new(),
            tools,
            tool_choice,
        }
    }

    fn build_messages(&self, ctx: &ExecutionContext) -> Vec<Message> {
        self.data
            .prompts
            .iter()
            .map(|prompt| {
                let text = ctx.variable_pool.resolve_template(&prompt.text);
                Message::new(Role::from(prompt.role.as_str()), text)
            })
            .collect()
    }

    fn build_tool_definitions(&self, registry: &ToolRegistry) -> Vec<ToolDefinition> {
        let mut defs = Vec::with_capacity(self.data.tools.len());
        for binding in &self.data.tools {
            let Some(tool) = registry.get(&binding.name) else {
                tracing::warn!(
                    node_id = %self.id(),
                    tool = %binding.name,
                    "tool not found in registry"
                );
                continue;
            };
            defs.push(ToolDefinition::function(
                tool.name(),
                binding.description.trim(),
                tool.parameters(),
            ));
        }
        defs
    }

    /// Merge DSL static args (base) with the model's JSON arguments
    /// (override). A parse failure on the model side passes the raw
    /// string through unchanged.
    fn merge_tool_args(&self, tool_name: &str, llm_arguments: &str) -> String {
        let dsl_args = self
            .data
            .tools
            .iter()
            .find(|b| b.name == tool_name)
            .and_then(|b| b.args.as_ref());
        let Some(dsl_args) = dsl_args.filter(|m| !m.is_empty()) else {
            return llm_arguments.to_string();
        };

        let Ok(Value::Object(llm_args)) = serde_json::from_str::<Value>(llm_arguments) else {
            return llm_arguments.to_string();
        };

        let mut merged = dsl_args.clone();
        for (k, v) in llm_args {
            merged.insert(k, v);
        }
        serde_json::to_string(&Value::Object(merged)).unwrap_or_else(|_| llm_arguments.to_string())
    }

    /// Assemble the final message list in the contract order:
    /// system prompts, key facts, mid-term summary, gateway summary,
    /// recent history, current user input.
    async fn inject_memory(
        &self,
        ctx: &ExecutionContext,
        messages: Vec<Message>,
        user_input: &str,
    ) -> Vec<Message> {
        let Some(config) = &self.data.memory else {
            return messages;
        };
        if !config.is_short_term_enabled() {
            return messages;
        }
        let (Some(coordinator), Some(conversation_id)) = (&ctx.memory, &ctx.conversation_id) else {
            tracing::warn!(node_id = %self.id(), "memory enabled but coordinator or conversation_id missing");
            return messages;
        };

        let recall = coordinator
            .recall(conversation_id, config, ctx.scope.as_ref())
            .await;
        if recall.short_term_messages.is_empty()
            && recall.mid_term_summary.is_empty()
            && recall.gateway_summary.is_empty()
            && recall.key_facts.is_empty()
        {
            return messages;
        }

        let mut assembled = Vec::with_capacity(messages.len() + recall.short_term_messages.len() + 4);
        assembled.extend(messages.iter().filter(|m| m.role == Role::System).cloned());

        if !recall.key_facts.is_empty() {
            let facts = recall
                .key_facts
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n");
            assembled.push(Message::system(format!("## Key Facts\n{facts}\n")));
        }
        if !recall.mid_term_summary.is_empty() {
            assembled.push(Message::system(format!(
                "## Mid-Term Memory Summary\n{}",
                recall.mid_term_summary
            )));
        }
        if !recall.gateway_summary.is_empty() {
            assembled.push(Message::system(format!(
                "## Compressed Context Summary\n{}",
                recall.gateway_summary
            )));
        }
        assembled.extend(recall.short_term_messages);
        if !user_input.is_empty() {
            assembled.push(Message::user(user_input));
        }

        tracing::info!(
            node_id = %self.id(),
            conversation_id = %conversation_id,
            assembled = assembled.len(),
            "memory injected into messages"
        );
        assembled
    }

    /// Memorize the turn fire-and-forget, inheriting the tenant scope
    /// into the detached context.
    fn save_memory(&self, ctx: &ExecutionContext, user_input: String, assistant_output: String) {
        let Some(config) = &self.data.memory else {
            return;
        };
        if !config.is_short_term_enabled() {
            return;
        }
        let (Some(coordinator), Some(conversation_id)) =
            (ctx.memory.clone(), ctx.conversation_id.clone())
        else {
            return;
        };

        let request = MemorizeRequest {
            conversation_id,
            config: config.clone(),
            user_message: Message::user(user_input),
            assistant_message: Message::assistant(assistant_output),
            scope: ctx.scope.clone(),
        };
        let node_id = self.id().to_string();
        tokio::spawn(async move {
            if let Err(err) = coordinator.memorize(request).await {
                tracing::warn!(node_id = %node_id, error = %err, "memorize failed");
            }
        });
    }
}

/// The current user input is the last non-system message of the rendered
/// prompts.
fn extract_user_input(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role != Role::System)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

#[async_trait]
impl WorkflowNode for LlmNode {
    delegate_base!();

    async fn run(self: Arc<Self>, ctx: ExecutionContext) -> flume::Receiver<NodeEvent> {
        let node = self.clone();
        run_stream_with_events(
            self.id().to_string(),
            self.node_type(),
            self.title().to_string(),
            move |stream| async move { node.execute(ctx, stream).await },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_input_is_last_non_system_message() {
        let messages = vec![
            Message::system("sys"),
            Message::user("first"),
            Message::assistant("mid"),
            Message::user("last"),
            Message::system("trailing sys"),
        ];
        assert_eq!(extract_user_input(&messages), "last");
        assert_eq!(extract_user_input(&[Message::system("only")]), "");
    }
}
