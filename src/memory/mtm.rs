//! Mid-term memory: per-conversation summaries behind a cache-aside
//! read path.
//!
//! Reads hit the cache first (keyed per tenant + conversation when a
//! scope is present), fall back to the store, and populate the cache
//! with a default 30-minute TTL. Writes go to the store and invalidate
//! the cache.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::MemoryError;
use crate::message::Message;
use crate::provider::{CompletionRequest, LlmProvider};
use crate::types::TenantScope;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// A conversation's rolling summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub content: String,
    /// Turns already represented by the summary.
    pub turns_covered: usize,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSummary {
    #[must_use]
    pub fn new(content: impl Into<String>, turns_covered: usize) -> Self {
        ConversationSummary {
            content: content.into(),
            turns_covered,
            updated_at: Utc::now(),
        }
    }
}

/// The MTM storage capability.
#[async_trait]
pub trait MidTermMemory: Send + Sync {
    async fn load_summary(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, MemoryError>;

    async fn save_summary(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
        summary: &ConversationSummary,
    ) -> Result<(), MemoryError>;
}

/// Generates/updates a summary from conversation messages.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    /// `existing_summary` is included for incremental updates; empty
    /// means a fresh summary.
    async fn summarize(
        &self,
        messages: &[Message],
        existing_summary: &str,
    ) -> Result<String, MemoryError>;
}

/// LLM-backed summary generator.
pub struct LlmSummaryGenerator {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmSummaryGenerator {
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        LlmSummaryGenerator {
            provider,
            model: model.into(),
        }
    }
}

const SUMMARY_SYSTEM_PROMPT: &str = "You maintain a running summary of a conversation. \
Preserve goals, constraints, decisions and facts; drop chatter and repetition. \
Reply with the updated summary text only.";

#[async_trait]
impl SummaryGenerator for LlmSummaryGenerator {
    async fn summarize(
        &self,
        messages: &[Message],
        existing_summary: &str,
    ) -> Result<String, MemoryError> {
        let mut prompt = String::new();
        if !existing_summary.is_empty() {
            prompt.push_str("Existing summary:\n");
            prompt.push_str(existing_summary);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Conversation:\n");
        for message in messages {
            prompt.push_str(&format!("{}: {}\n", message.role, message.content));
        }
        prompt.push_str("\nUpdate the summary to cover the conversation above.");

        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(prompt)],
            temperature: Some(0.3),
            max_tokens: Some(600),
            ..CompletionRequest::default()
        };
        let response = self.provider.complete(request).await?;
        Ok(response.content.trim().to_string())
    }
}

/// Summary cache used by the cache-aside wrapper.
#[async_trait]
pub trait SummaryCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ConversationSummary>, MemoryError>;
    async fn put(
        &self,
        key: &str,
        summary: &ConversationSummary,
        ttl: Duration,
    ) -> Result<(), MemoryError>;
    async fn invalidate(&self, key: &str) -> Result<(), MemoryError>;
}

/// Cache-aside wrapper over a summary store.
pub struct CachedMtm {
    cache: Arc<dyn SummaryCache>,
    store: Arc<dyn MidTermMemory>,
    cache_ttl: Duration,
}

impl CachedMtm {
    #[must_use]
    pub fn new(cache: Arc<dyn SummaryCache>, store: Arc<dyn MidTermMemory>) -> Self {
        CachedMtm {
            cache,
            store,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn cache_key(scope: Option<&TenantScope>, conversation_id: &str) -> String {
        match scope {
            Some(scope) => format!("mtm:{}:{}:{conversation_id}", scope.org_id, scope.tenant_id),
            None => format!("mtm::{conversation_id}"),
        }
    }
}

#[async_trait]
impl MidTermMemory for CachedMtm {
    async fn load_summary(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, MemoryError> {
        let key = Self::cache_key(scope, conversation_id);

        match self.cache.get(&key).await {
            Ok(Some(summary)) => return Ok(Some(summary)),
            Ok(None) => {}
            Err(err) => tracing::warn!(key = %key, error = %err, "summary cache read failed"),
        }

        let summary = self.store.load_summary(scope, conversation_id).await?;
        if let Some(summary) = &summary {
            if let Err(err) = self.cache.put(&key, summary, self.cache_ttl).await {
                tracing::warn!(key = %key, error = %err, "summary cache populate failed");
            }
        }
        Ok(summary)
    }

    async fn save_summary(
        &self,
        scope: Option<&TenantScope>,
        conversation_id: &str,
        summary: &ConversationSummary,
    ) -> Result<(), MemoryError> {
        self.store.save_summary(scope, conversation_id, summary).await?;
        let key = Self::cache_key(scope, conversation_id);
        if let Err(err) = self.cache.invalidate(&key).await {
            tracing::warn!(key = %key, error = %err, "summary cache invalidate failed");
        }
        Ok(())
    }
}

/// Redis JSON cache for summaries.
pub struct RedisSummaryCache {
    conn: ConnectionManager,
}

impl RedisSummaryCache {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        RedisSummaryCache { conn }
    }
}

#[async_trait]
impl SummaryCache for RedisSummaryCache {
    async fn get(&self, key: &str) -> Result<Option<ConversationSummary>, MemoryError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| MemoryError::Store(e.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        summary: &ConversationSummary,
        ttl: Duration,
    ) -> Result<(), MemoryError> {
        let raw = serde_json::to_string(summary)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, raw, ttl.as_secs())
            .await
            .map_err(|e| MemoryError::Store(e.to_string()))?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), MemoryError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| MemoryError::Store(e.to_string()))?;
        Ok(())
    }
}

/// In-process summary store.
#[derive(Default)]
pub struct InMemoryMtmStore {
    summaries: Mutex<FxHashMap<String, ConversationSummary>>,
}

impl InMemoryMtmStore {
    #[must_use]
    pub fn new() -> Self {
        InMemoryMtmStore::default()
    }
}

#[async_trait]
impl MidTermMemory for InMemoryMtmStore {
    async fn load_summary(
        &self,
        _scope: Option<&TenantScope>,
        conversation_id: &str,
    ) -> Result<Option<ConversationSummary>, MemoryError> {
        Ok(self
            .summaries
            .lock()
            .expect("mtm poisoned")
            .get(conversation_id)
            .cloned())
    }

    async fn save_summary(
        &self,
        _scope: Option<&TenantScope>,
        conversation_id: &str,
        summary: &ConversationSummary,
    ) -> Result<(), MemoryError> {
        self.summaries
            .lock()
            .expect("mtm poisoned")
            .insert(conversation_id.to_string(), summary.clone());
        Ok(())
    }
}

/// In-process summary cache with TTL eviction on read.
#[derive(Default)]
pub struct InMemorySummaryCache {
    entries: Mutex<FxHashMap<String, (ConversationSummary, Instant, Duration)>>,
}

impl InMemorySummaryCache {
    #[must_use]
    pub fn new() -> Self {
        InMemorySummaryCache::default()
    }
}

#[async_trait]
impl SummaryCache for InMemorySummaryCache {
    async fn get(&self, key: &str) -> Result<Option<ConversationSummary>, MemoryError> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        if let Some((summary, stored_at, ttl)) = entries.get(key) {
            if stored_at.elapsed() < *ttl {
                return Ok(Some(summary.clone()));
            }
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        summary: &ConversationSummary,
        ttl: Duration,
    ) -> Result<(), MemoryError> {
        self.entries
            .lock()
            .expect("cache poisoned")
            .insert(key.to_string(), (summary.clone(), Instant::now(), ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), MemoryError> {
        self.entries.lock().expect("cache poisoned").remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_aside_populates_and_invalidates() {
        let cache = Arc::new(InMemorySummaryCache::new());
        let store = Arc::new(InMemoryMtmStore::new());
        let mtm = CachedMtm::new(cache.clone(), store.clone());

        assert!(mtm.load_summary(None, "c1").await.unwrap().is_none());

        let summary = ConversationSummary::new("first", 5);
        mtm.save_summary(None, "c1", &summary).await.unwrap();

        // Miss populates the cache.
        let loaded = mtm.load_summary(None, "c1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "first");
        assert!(cache.get("mtm::c1").await.unwrap().is_some());

        // A write invalidates it again.
        mtm.save_summary(None, "c1", &ConversationSummary::new("second", 8))
            .await
            .unwrap();
        assert!(cache.get("mtm::c1").await.unwrap().is_none());
        let loaded = mtm.load_summary(None, "c1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "second");
    }

    #[tokio::test]
    async fn cache_keys_are_tenant_scoped() {
        let scope = TenantScope::new("org_a", "tenant_a");
        assert_eq!(
            CachedMtm::cache_key(Some(&scope), "c1"),
            "mtm:org_a:tenant_a:c1"
        );
        assert_eq!(CachedMtm::cache_key(None, "c1"), "mtm::c1");
    }
}
