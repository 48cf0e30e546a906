//! Short-term memory: per-conversation state with version-CAS writes.
//!
//! Every mutation bumps the monotonic `version`; writers prepare the new
//! state with `version + 1` and save conditionally on the version they
//! observed. [`ShortTermMemory::append`] retries bounded times on
//! conflict, surfacing [`MemoryError::VersionConflict`] on exhaustion.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::MemoryError;
use crate::message::Message;

/// Bounded CAS retries for appends.
const APPEND_MAX_RETRIES: u32 = 5;

/// The per-conversation short-term state, persisted as one hash.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StmState {
    pub conversation_id: String,
    #[serde(default)]
    pub recent_messages: Vec<Message>,
    #[serde(default)]
    pub gateway_summary: String,
    #[serde(default)]
    pub key_facts: BTreeMap<String, String>,
    #[serde(default)]
    pub token_estimate: u64,
    /// Unix seconds of the last gateway compression.
    #[serde(default)]
    pub last_compressed_at: i64,
    #[serde(default)]
    pub compressed_turn_count: u32,
    /// Monotonic, incremented on every mutation.
    #[serde(default)]
    pub version: u64,
}

impl StmState {
    #[must_use]
    pub fn new(conversation_id: impl Into<String>) -> Self {
        StmState {
            conversation_id: conversation_id.into(),
            ..StmState::default()
        }
    }

    /// Completed turns (one turn = user + assistant message).
    #[must_use]
    pub fn turn_count(&self) -> usize {
        self.recent_messages.len() / 2
    }
}

/// The STM storage capability.
///
/// `load`, `append` and `turn_count` have default implementations on top
/// of the state-level primitives, so backends only implement load /
/// CAS-save / clear.
#[async_trait]
pub trait ShortTermMemory: Send + Sync {
    /// Load the full state; a missing conversation yields an empty state
    /// at version 0.
    async fn load_state(&self, conversation_id: &str) -> Result<StmState, MemoryError>;

    /// Save `state` only if the stored version still equals
    /// `expected_version`. Returns false on conflict.
    async fn save_state_if_version(
        &self,
        conversation_id: &str,
        state: &StmState,
        expected_version: u64,
    ) -> Result<bool, MemoryError>;

    /// Drop the conversation's state entirely.
    async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError>;

    /// Load the most recent `window_size` turns (0 = everything).
    async fn load(
        &self,
        conversation_id: &str,
        window_size: usize,
    ) -> Result<Vec<Message>, MemoryError> {
        let state = self.load_state(conversation_id).await?;
        let mut messages = state.recent_messages;
        let max_messages = window_size * 2;
        if max_messages > 0 && messages.len() > max_messages {
            messages = messages.split_off(messages.len() - max_messages);
        }
        Ok(messages)
    }

    /// Append messages under CAS, retrying bounded times.
    async fn append(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<(), MemoryError> {
        for attempt in 1..=APPEND_MAX_RETRIES {
            let mut state = self.load_state(conversation_id).await?;
            let base_version = state.version;

            state.recent_messages.extend(messages.iter().cloned());
            state.version = base_version + 1;

            if self
                .save_state_if_version(conversation_id, &state, base_version)
                .await?
            {
                return Ok(());
            }

            tracing::warn!(
                conversation_id = %conversation_id,
                attempt,
                max_retries = APPEND_MAX_RETRIES,
                "stm append version conflict, retrying"
            );
        }
        Err(MemoryError::VersionConflict)
    }

    /// Number of completed turns currently retained.
    async fn turn_count(&self, conversation_id: &str) -> Result<usize, MemoryError> {
        Ok(self.load_state(conversation_id).await?.turn_count())
    }
}

/// In-process STM with the same CAS semantics as the Redis backend.
#[derive(Default)]
pub struct InMemoryStm {
    states: Mutex<FxHashMap<String, StmState>>,
}

impl InMemoryStm {
    #[must_use]
    pub fn new() -> Self {
        InMemoryStm::default()
    }
}

#[async_trait]
impl ShortTermMemory for InMemoryStm {
    async fn load_state(&self, conversation_id: &str) -> Result<StmState, MemoryError> {
        let states = self.states.lock().expect("stm poisoned");
        Ok(states
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| StmState::new(conversation_id)))
    }

    async fn save_state_if_version(
        &self,
        conversation_id: &str,
        state: &StmState,
        expected_version: u64,
    ) -> Result<bool, MemoryError> {
        let mut states = self.states.lock().expect("stm poisoned");
        let current_version = states.get(conversation_id).map_or(0, |s| s.version);
        if current_version != expected_version {
            return Ok(false);
        }
        let mut stored = state.clone();
        stored.conversation_id = conversation_id.to_string();
        states.insert(conversation_id.to_string(), stored);
        Ok(true)
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError> {
        self.states
            .lock()
            .expect("stm poisoned")
            .remove(conversation_id);
        Ok(())
    }
}
