//! The LLM provider contract.
//!
//! Providers are opaque collaborators exposing non-streaming
//! [`complete`](LlmProvider::complete) and streaming
//! [`stream_complete`](LlmProvider::stream_complete). Concrete HTTP
//! encodings live outside the core; the engine only depends on this
//! trait and the [`ProviderRegistry`] used to resolve a provider by name.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::message::Message;

/// Errors surfaced by provider implementations.
#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("provider not found: {name}")]
    #[diagnostic(
        code(flowweave::provider::not_found),
        help("Register the provider before running workflows that reference it.")
    )]
    NotFound { name: String },

    #[error("provider request failed: {0}")]
    #[diagnostic(code(flowweave::provider::request))]
    Request(String),

    #[error("provider stream failed: {0}")]
    #[diagnostic(code(flowweave::provider::stream))]
    Stream(String),
}

/// A chat-completion request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// A complete (non-streaming) response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub finish_reason: String,
    #[serde(default)]
    pub usage: Usage,
}

/// One streamed fragment. `tool_calls` arrive fragmentarily and must be
/// reassembled with [`ToolCallAccumulator`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub delta: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finish_reason: String,
}

/// Token accounting reported by the provider.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Tool definition handed to the model (`type` is always `"function"`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

impl ToolDefinition {
    #[must_use]
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        ToolDefinition {
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments.
    pub parameters: Value,
}

/// A fully assembled tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Raw JSON string of the arguments, exactly as the model produced it.
    pub arguments: String,
}

/// A streamed tool-call fragment, addressed by `index`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Reassembles streamed [`ToolCallDelta`]s into [`ToolCall`]s.
///
/// Fragments for the same index concatenate their argument pieces; id and
/// name stick from the first fragment that carries them.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: Vec<PartialCall>,
}

#[derive(Debug, Default, Clone)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        ToolCallAccumulator::default()
    }

    /// Feed one fragment.
    pub fn push(&mut self, delta: &ToolCallDelta) {
        if delta.index >= self.slots.len() {
            self.slots.resize(delta.index + 1, PartialCall::default());
        }
        let slot = &mut self.slots[delta.index];
        if let Some(id) = &delta.id {
            if slot.id.is_empty() {
                slot.id = id.clone();
            }
        }
        if let Some(name) = &delta.name {
            if slot.name.is_empty() {
                slot.name = name.clone();
            }
        }
        if let Some(args) = &delta.arguments {
            slot.arguments.push_str(args);
        }
    }

    /// Finish accumulation, dropping empty slots.
    #[must_use]
    pub fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .filter(|slot| !slot.id.is_empty() || !slot.name.is_empty())
            .map(|slot| ToolCall {
                id: slot.id,
                kind: "function".to_string(),
                function: ToolCallFunction {
                    name: slot.name,
                    arguments: slot.arguments,
                },
            })
            .collect()
    }
}

/// The provider capability consumed by the core.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used for registry lookup and trace records.
    fn name(&self) -> &str;

    /// Non-streaming completion.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, ProviderError>;

    /// Streaming completion. Chunks arrive on the first channel; at most
    /// one error arrives on the second. Both channels close when the
    /// stream ends.
    async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<(flume::Receiver<CompletionChunk>, flume::Receiver<ProviderError>), ProviderError>;
}

/// Name → provider lookup table.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: FxHashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_reassembles_interleaved_fragments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&ToolCallDelta {
            index: 0,
            id: Some("call_a".into()),
            name: Some("search".into()),
            arguments: Some("{\"q\":".into()),
        });
        acc.push(&ToolCallDelta {
            index: 1,
            id: Some("call_b".into()),
            name: Some("lookup".into()),
            arguments: Some("{}".into()),
        });
        acc.push(&ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments: Some("\"tokyo\"}".into()),
        });

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, "{\"q\":\"tokyo\"}");
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn empty_slots_are_dropped() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(&ToolCallDelta {
            index: 2,
            id: Some("c".into()),
            name: Some("f".into()),
            arguments: None,
        });
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c");
    }

    #[test]
    fn registry_lookup_errors_on_unknown() {
        let reg = ProviderRegistry::new();
        assert!(matches!(
            reg.get("nope"),
            Err(ProviderError::NotFound { .. })
        ));
    }
}
