//! Shared fixtures: a scripted LLM provider, local test functions, a spy
//! tool, and DSL helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use flowweave::context::ExecutionContext;
use flowweave::events::{EventKind, GraphEvent};
use flowweave::nodes::function::{FunctionError, FunctionRegistry, LocalFunction};
use flowweave::provider::{
    CompletionChunk, CompletionRequest, CompletionResponse, LlmProvider, ProviderError,
    ProviderRegistry, ToolCall, Usage,
};
use flowweave::tool::{Tool, ToolError};
use flowweave::types::{new_var_map, VarMap};

/// A provider that replays scripted responses and records every request.
pub struct ScriptedProvider {
    name: String,
    responses: Mutex<Vec<CompletionResponse>>,
    pub requests: Mutex<Vec<CompletionRequest>>,
    pub complete_calls: AtomicU32,
    /// Artificial latency per call, for race-shaped tests.
    pub delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        ScriptedProvider {
            name: name.to_string(),
            responses: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            complete_calls: AtomicU32::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a plain-text response.
    pub fn push_text(&self, text: &str) {
        self.responses.lock().unwrap().push(CompletionResponse {
            content: text.to_string(),
            model: "scripted".to_string(),
            finish_reason: "stop".to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            ..CompletionResponse::default()
        });
    }

    /// Queue a tool-calling response.
    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) {
        self.responses.lock().unwrap().push(CompletionResponse {
            tool_calls: calls,
            model: "scripted".to_string(),
            finish_reason: "tool_calls".to_string(),
            usage: Usage {
                total_tokens: 7,
                ..Usage::default()
            },
            ..CompletionResponse::default()
        });
    }

    pub fn recorded_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self) -> CompletionResponse {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            CompletionResponse {
                content: "scripted fallback".to_string(),
                model: "scripted".to_string(),
                finish_reason: "stop".to_string(),
                ..CompletionResponse::default()
            }
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().unwrap().push(request);
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_response())
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<(flume::Receiver<CompletionChunk>, flume::Receiver<ProviderError>), ProviderError>
    {
        self.requests.lock().unwrap().push(request);
        let response = self.next_response();

        let (chunk_tx, chunk_rx) = flume::bounded(16);
        let (_err_tx, err_rx) = flume::bounded::<ProviderError>(1);

        tokio::spawn(async move {
            // Stream in two pieces to exercise accumulation.
            let content = response.content;
            let mid = content.len() / 2;
            let mid = content
                .char_indices()
                .map(|(i, _)| i)
                .find(|i| *i >= mid)
                .unwrap_or(content.len());
            for piece in [&content[..mid], &content[mid..]] {
                if piece.is_empty() {
                    continue;
                }
                let _ = chunk_tx
                    .send_async(CompletionChunk {
                        delta: piece.to_string(),
                        ..CompletionChunk::default()
                    })
                    .await;
            }
        });

        Ok((chunk_rx, err_rx))
    }
}

/// Registry with a single scripted provider under `name`.
pub fn provider_registry(provider: Arc<ScriptedProvider>) -> Arc<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    registry.register(provider);
    Arc::new(registry)
}

/// `echo`: returns `{result: text}`.
pub struct EchoFunction;

#[async_trait]
impl LocalFunction for EchoFunction {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, inputs: VarMap) -> Result<VarMap, FunctionError> {
        let text = inputs
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut outputs = new_var_map();
        outputs.insert("result".to_string(), json!(text));
        Ok(outputs)
    }
}

/// `always_fails`: errors on every call.
pub struct FailingFunction;

#[async_trait]
impl LocalFunction for FailingFunction {
    fn name(&self) -> &str {
        "always_fails"
    }

    async fn execute(&self, _inputs: VarMap) -> Result<VarMap, FunctionError> {
        Err("intentional failure".into())
    }
}

/// `flaky`: fails the first `failures` calls, then echoes.
pub struct FlakyFunction {
    pub failures: u32,
    pub calls: AtomicU32,
}

impl FlakyFunction {
    pub fn new(failures: u32) -> Self {
        FlakyFunction {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LocalFunction for FlakyFunction {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, inputs: VarMap) -> Result<VarMap, FunctionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(format!("transient failure #{}", call + 1).into());
        }
        let text = inputs
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let mut outputs = new_var_map();
        outputs.insert("result".to_string(), json!(text));
        Ok(outputs)
    }
}

/// `slow`: sleeps before echoing, for abort/pause/timeout tests.
pub struct SlowFunction {
    pub delay: Duration,
}

#[async_trait]
impl LocalFunction for SlowFunction {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _inputs: VarMap) -> Result<VarMap, FunctionError> {
        tokio::time::sleep(self.delay).await;
        let mut outputs = new_var_map();
        outputs.insert("result".to_string(), json!("done"));
        Ok(outputs)
    }
}

/// Registry with the standard test functions.
pub fn function_registry() -> Arc<FunctionRegistry> {
    let registry = FunctionRegistry::new();
    registry.register(Arc::new(EchoFunction)).unwrap();
    registry.register(Arc::new(FailingFunction)).unwrap();
    registry
        .register(Arc::new(SlowFunction {
            delay: Duration::from_millis(100),
        }))
        .unwrap();
    Arc::new(registry)
}

/// A tool that records its invocations and answers with a fixed string.
pub struct SpyTool {
    pub invocations: Mutex<Vec<String>>,
    pub reply: String,
}

impl SpyTool {
    pub fn new(reply: &str) -> Self {
        SpyTool {
            invocations: Mutex::new(Vec::new()),
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
impl Tool for SpyTool {
    fn name(&self) -> &str {
        "spy_search"
    }

    fn description(&self) -> &str {
        "implementation-side description that must never reach the model"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}}
        })
    }

    async fn execute(&self, _ctx: &ExecutionContext, arguments: &str) -> Result<String, ToolError> {
        self.invocations.lock().unwrap().push(arguments.to_string());
        Ok(self.reply.clone())
    }
}

/// Drain a graph event stream to the end.
pub async fn collect_events(rx: flume::Receiver<GraphEvent>) -> Vec<GraphEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_async().await {
        events.push(event);
    }
    events
}

/// Ids of nodes that emitted the given event kind, in stream order.
pub fn node_ids_of(events: &[GraphEvent], kind: EventKind) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.kind == kind)
        .filter_map(|e| e.node_id.clone())
        .collect()
}

/// Index of the first event matching `kind` for `node_id`.
pub fn event_index(events: &[GraphEvent], kind: EventKind, node_id: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.kind == kind && e.node_id.as_deref() == Some(node_id))
}

/// Inputs helper.
pub fn inputs(pairs: &[(&str, Value)]) -> VarMap {
    let mut map = new_var_map();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}
