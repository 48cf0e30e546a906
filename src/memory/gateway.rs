//! The context-gateway compressor.
//!
//! Rewrites older STM messages into a compact summary (plus optional key
//! facts) with a dedicated LLM, leaving the last `min_recent_turns × 2`
//! messages untouched. Parsing tolerates Markdown fences; a malformed
//! response degrades to using the raw text as the summary with the
//! existing facts retained.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use super::tokens::TokenEstimator;
use super::MemoryError;
use crate::message::{Message, Role};
use crate::provider::{CompletionRequest, LlmProvider};

/// Cap on retained key facts.
pub const MAX_KEY_FACTS: usize = 20;

const COMPRESS_TEMPERATURE: f64 = 0.2;
const COMPRESS_MAX_TOKENS: u32 = 800;

const GATEWAY_SYSTEM_PROMPT: &str = "You are a conversation-context compression engine. \
Rewrite the conversation memory into a compact form while keeping the essentials.
Requirements:
1. Keep task goals, constraints, decisions and conclusions
2. Keep key facts and data
3. Keep the user's preferences and requirements
4. Drop chatter, repetition and irrelevant detail
5. The output must be valid JSON";

/// Result of one compression pass.
#[derive(Clone, Debug, Deserialize)]
pub struct CompressResult {
    pub compressed_summary: String,
    #[serde(default)]
    pub key_facts: BTreeMap<String, String>,
}

/// Token-budget-triggered LLM compressor.
pub struct GatewayCompressor {
    provider: Arc<dyn LlmProvider>,
    model: String,
    estimator: Arc<dyn TokenEstimator>,
}

impl GatewayCompressor {
    #[must_use]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        GatewayCompressor {
            provider,
            model: model.into(),
            estimator,
        }
    }

    #[must_use]
    pub fn estimator(&self) -> Arc<dyn TokenEstimator> {
        self.estimator.clone()
    }

    /// Compress `messages` into the existing summary, optionally
    /// extracting new key facts.
    pub async fn compress(
        &self,
        existing_summary: &str,
        messages: &[Message],
        existing_facts: &BTreeMap<String, String>,
        extract_key_facts: bool,
    ) -> Result<CompressResult, MemoryError> {
        tracing::info!(
            model = %self.model,
            messages_to_compress = messages.len(),
            has_existing_summary = !existing_summary.is_empty(),
            existing_facts = existing_facts.len(),
            extract_key_facts,
            "starting gateway compression"
        );

        let prompt = build_compress_prompt(existing_summary, messages, extract_key_facts);
        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(GATEWAY_SYSTEM_PROMPT),
                Message::user(prompt),
            ],
            temperature: Some(COMPRESS_TEMPERATURE),
            max_tokens: Some(COMPRESS_MAX_TOKENS),
            ..CompletionRequest::default()
        };

        let response = self.provider.complete(request).await?;

        let result = match parse_compress_response(&response.content) {
            Ok(mut result) => {
                result.key_facts = merge_key_facts(result.key_facts, existing_facts);
                result
            }
            Err(err) => {
                tracing::warn!(error = %err, "unstructured compression response, using raw text");
                CompressResult {
                    compressed_summary: response.content.trim().to_string(),
                    key_facts: existing_facts.clone(),
                }
            }
        };

        tracing::info!(
            summary_length = result.compressed_summary.len(),
            key_facts = result.key_facts.len(),
            "gateway compression completed"
        );
        Ok(result)
    }
}

/// Split messages into (to_compress, to_keep), reserving the last
/// `min_recent_turns × 2` messages. Too few messages means nothing to
/// compress.
#[must_use]
pub fn select_messages_for_compression(
    messages: &[Message],
    min_recent_turns: usize,
) -> (Vec<Message>, Vec<Message>) {
    let reserve = min_recent_turns * 2;
    if messages.len() <= reserve {
        return (Vec::new(), messages.to_vec());
    }
    let cutoff = messages.len() - reserve;
    (messages[..cutoff].to_vec(), messages[cutoff..].to_vec())
}

fn build_compress_prompt(
    existing_summary: &str,
    messages: &[Message],
    extract_key_facts: bool,
) -> String {
    let mut prompt = String::new();

    if !existing_summary.is_empty() {
        prompt.push_str("Existing memory:\n");
        prompt.push_str(existing_summary);
        prompt.push_str("\n\n");
    }

    prompt.push_str("New conversation messages:\n");
    for message in messages {
        match message.role {
            Role::User => prompt.push_str(&format!("User: {}\n", message.content)),
            Role::Assistant => prompt.push_str(&format!("Assistant: {}\n", message.content)),
            _ => {}
        }
    }

    prompt.push_str("\nCompress the content above into a compact memory summary.\n");
    if extract_key_facts {
        prompt.push_str(
            "Also extract key facts as key-value pairs (e.g. \"destination\": \"Tokyo\").\n\
             \nReply in this JSON format:\n\
             {\n  \"compressed_summary\": \"...\",\n  \"key_facts\": {\"key\": \"value\"}\n}\n",
        );
    } else {
        prompt.push_str(
            "\nReply in this JSON format:\n{\n  \"compressed_summary\": \"...\"\n}\n",
        );
    }

    prompt
}

fn parse_compress_response(response: &str) -> Result<CompressResult, MemoryError> {
    let mut text = response.trim();

    // Strip a surrounding Markdown code fence.
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped.strip_suffix("```").unwrap_or(stripped).trim();
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped.strip_suffix("```").unwrap_or(stripped).trim();
    }

    let result: CompressResult = serde_json::from_str(text)?;
    if result.compressed_summary.is_empty() {
        return Err(MemoryError::Store("compressed_summary is empty".to_string()));
    }
    Ok(result)
}

/// Union of new and existing facts; existing keys win on collision, and
/// the result is truncated to the [`MAX_KEY_FACTS`] most recent entries
/// (newly extracted facts count as most recent).
fn merge_key_facts(
    new_facts: BTreeMap<String, String>,
    existing: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut ordered: Vec<(String, String)> = existing
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (k, v) in new_facts {
        if !existing.contains_key(&k) {
            ordered.push((k, v));
        }
    }

    if ordered.len() > MAX_KEY_FACTS {
        ordered.drain(..ordered.len() - MAX_KEY_FACTS);
    }
    ordered.into_iter().collect()
}
