//! Redis-backed short-term memory.
//!
//! One hash per conversation with fields `recent_messages` (JSON array),
//! `gateway_summary`, `key_facts` (JSON object), `token_estimate`,
//! `last_compressed_at`, `compressed_turn_count` and `version`. The TTL
//! (default 24 h) is refreshed on every write. CAS saves run as a Lua
//! script so the version check and the hash write are atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::stm::{ShortTermMemory, StmState};
use super::MemoryError;

const DEFAULT_KEY_PREFIX: &str = "stm:v2:";
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Conditional hash write: compare the stored `version` field, write all
/// fields and refresh the TTL only when it matches.
const CAS_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'version')
if current == false then current = '0' end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1],
    'recent_messages', ARGV[2],
    'gateway_summary', ARGV[3],
    'key_facts', ARGV[4],
    'token_estimate', ARGV[5],
    'last_compressed_at', ARGV[6],
    'compressed_turn_count', ARGV[7],
    'version', ARGV[8])
redis.call('EXPIRE', KEYS[1], ARGV[9])
return 1
";

/// Redis hash implementation of [`ShortTermMemory`].
pub struct RedisStm {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
    cas_script: Script,
}

impl RedisStm {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        RedisStm {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
            cas_script: Script::new(CAS_SCRIPT),
        }
    }

    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(&self, conversation_id: &str) -> String {
        format!("{}{}", self.key_prefix, conversation_id)
    }
}

fn store_err(err: redis::RedisError) -> MemoryError {
    MemoryError::Store(err.to_string())
}

#[async_trait]
impl ShortTermMemory for RedisStm {
    async fn load_state(&self, conversation_id: &str) -> Result<StmState, MemoryError> {
        let key = self.key(conversation_id);
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(store_err)?;

        let mut state = StmState::new(conversation_id);
        if fields.is_empty() {
            return Ok(state);
        }

        if let Some(raw) = fields.get("recent_messages").filter(|r| !r.is_empty()) {
            match serde_json::from_str(raw) {
                Ok(messages) => state.recent_messages = messages,
                Err(err) => tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to parse recent_messages"
                ),
            }
        }
        if let Some(summary) = fields.get("gateway_summary") {
            state.gateway_summary = summary.clone();
        }
        if let Some(raw) = fields.get("key_facts").filter(|r| !r.is_empty()) {
            match serde_json::from_str(raw) {
                Ok(facts) => state.key_facts = facts,
                Err(err) => tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to parse key_facts"
                ),
            }
        }
        if let Some(raw) = fields.get("token_estimate") {
            state.token_estimate = raw.parse().unwrap_or(0);
        }
        if let Some(raw) = fields.get("last_compressed_at") {
            state.last_compressed_at = raw.parse().unwrap_or(0);
        }
        if let Some(raw) = fields.get("compressed_turn_count") {
            state.compressed_turn_count = raw.parse().unwrap_or(0);
        }
        if let Some(raw) = fields.get("version") {
            state.version = raw.parse().unwrap_or(0);
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            recent_messages = state.recent_messages.len(),
            version = state.version,
            "stm state loaded"
        );
        Ok(state)
    }

    async fn save_state_if_version(
        &self,
        conversation_id: &str,
        state: &StmState,
        expected_version: u64,
    ) -> Result<bool, MemoryError> {
        let key = self.key(conversation_id);
        let recent_messages = serde_json::to_string(&state.recent_messages)?;
        let key_facts = serde_json::to_string(&state.key_facts)?;

        let mut conn = self.conn.clone();
        let saved: i64 = self
            .cas_script
            .key(&key)
            .arg(expected_version.to_string())
            .arg(recent_messages)
            .arg(&state.gateway_summary)
            .arg(key_facts)
            .arg(state.token_estimate.to_string())
            .arg(state.last_compressed_at.to_string())
            .arg(state.compressed_turn_count.to_string())
            .arg(state.version.to_string())
            .arg(self.ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(saved == 1)
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), MemoryError> {
        let key = self.key(conversation_id);
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&key).await.map_err(store_err)?;
        Ok(())
    }
}
