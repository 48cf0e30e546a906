//! The memory coordinator.
//!
//! Stateless orchestrator over STM, MTM and the gateway compressor. It
//! holds no per-conversation mutable state, so one instance is shared
//! across runs without locking. Recall fetches STM and MTM in parallel
//! and degrades silently; memorize appends under CAS and launches the
//! async compression/summarization passes when their thresholds fire.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use super::config::{GatewayConfig, MemoryConfig};
use super::gateway::{select_messages_for_compression, GatewayCompressor};
use super::lock::CompressionLock;
use super::mtm::{ConversationSummary, MidTermMemory, SummaryGenerator};
use super::stm::ShortTermMemory;
use super::tokens::{estimate_stm_context, should_compress};
use super::MemoryError;
use crate::message::Message;
use crate::types::TenantScope;

/// What recall could gather for an LLM invocation.
#[derive(Clone, Debug, Default)]
pub struct RecallResult {
    pub short_term_messages: Vec<Message>,
    pub mid_term_summary: String,
    pub gateway_summary: String,
    pub key_facts: BTreeMap<String, String>,
}

/// A turn to memorize after a successful LLM call.
#[derive(Clone, Debug)]
pub struct MemorizeRequest {
    pub conversation_id: String,
    pub config: MemoryConfig,
    pub user_message: Message,
    pub assistant_message: Message,
    /// Tenant scope inherited into the background passes.
    pub scope: Option<TenantScope>,
}

/// Orchestrates the three memory tiers around each LLM invocation.
pub struct MemoryCoordinator {
    short_term: Arc<dyn ShortTermMemory>,
    mid_term: Option<Arc<dyn MidTermMemory>>,
    summary_gen: Option<Arc<dyn SummaryGenerator>>,
    gateway: Option<Arc<GatewayCompressor>>,
    compress_lock: Option<Arc<dyn CompressionLock>>,
}

impl MemoryCoordinator {
    #[must_use]
    pub fn new(short_term: Arc<dyn ShortTermMemory>) -> Self {
        MemoryCoordinator {
            short_term,
            mid_term: None,
            summary_gen: None,
            gateway: None,
            compress_lock: None,
        }
    }

    /// Attach the mid-term tier.
    #[must_use]
    pub fn with_mid_term(
        mut self,
        mid_term: Arc<dyn MidTermMemory>,
        summary_gen: Arc<dyn SummaryGenerator>,
    ) -> Self {
        self.mid_term = Some(mid_term);
        self.summary_gen = Some(summary_gen);
        self
    }

    /// Attach the gateway compressor and its advisory lock.
    #[must_use]
    pub fn with_gateway(
        mut self,
        gateway: Arc<GatewayCompressor>,
        lock: Arc<dyn CompressionLock>,
    ) -> Self {
        self.gateway = Some(gateway);
        self.compress_lock = Some(lock);
        self
    }

    /// Load memory before an LLM call. Missing components degrade
    /// silently: the result carries whatever could be fetched.
    pub async fn recall(
        &self,
        conversation_id: &str,
        config: &MemoryConfig,
        scope: Option<&TenantScope>,
    ) -> RecallResult {
        let mut result = RecallResult::default();
        if conversation_id.is_empty() {
            return result;
        }

        let stm_future = async {
            if !config.is_short_term_enabled() {
                return None;
            }
            match self.short_term.load_state(conversation_id).await {
                Ok(state) => Some(state),
                Err(err) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %err,
                        "failed to load short-term state"
                    );
                    None
                }
            }
        };

        let mtm_future = async {
            if !config.is_mid_term_enabled() {
                return None;
            }
            let mid_term = self.mid_term.as_ref()?;
            match mid_term.load_summary(scope, conversation_id).await {
                Ok(summary) => summary,
                Err(err) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %err,
                        "failed to load mid-term summary"
                    );
                    None
                }
            }
        };

        let (stm_state, mtm_summary) = tokio::join!(stm_future, mtm_future);

        if let Some(state) = stm_state {
            let window = config.window_size() * 2;
            let mut messages = state.recent_messages;
            if window > 0 && messages.len() > window {
                messages = messages.split_off(messages.len() - window);
            }
            result.short_term_messages = messages;
            result.gateway_summary = state.gateway_summary;
            result.key_facts = state.key_facts;
        }
        if let Some(summary) = mtm_summary {
            result.mid_term_summary = summary.content;
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            stm_messages = result.short_term_messages.len(),
            has_mtm_summary = !result.mid_term_summary.is_empty(),
            has_gateway_summary = !result.gateway_summary.is_empty(),
            key_facts = result.key_facts.len(),
            "recall completed"
        );
        result
    }

    /// Persist a turn after an LLM call. Storage failures are logged and
    /// swallowed so the calling node is never penalized.
    pub async fn memorize(self: Arc<Self>, request: MemorizeRequest) -> Result<(), MemoryError> {
        if request.conversation_id.is_empty() {
            return Ok(());
        }
        let conversation_id = request.conversation_id.clone();

        if request.config.is_short_term_enabled() {
            let turn = vec![request.user_message.clone(), request.assistant_message.clone()];
            if let Err(err) = self.short_term.append(&conversation_id, turn).await {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to append short-term memory"
                );
                return Ok(());
            }
        }

        // Gateway compression: estimate the STM context and fire the
        // async pass when the token budget is exceeded.
        if request.config.is_gateway_enabled() && self.gateway.is_some() {
            if let Some(gateway_config) = request.config.gateway_config() {
                match self.short_term.load_state(&conversation_id).await {
                    Err(err) => tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %err,
                        "failed to load state for compression check"
                    ),
                    Ok(state) => {
                        let estimator = self
                            .gateway
                            .as_ref()
                            .expect("gateway present")
                            .estimator();
                        if should_compress(estimator.as_ref(), &state, gateway_config) {
                            tracing::info!(
                                conversation_id = %conversation_id,
                                token_estimate = estimate_stm_context(estimator.as_ref(), &state),
                                "token threshold exceeded, triggering async compression"
                            );
                            let coordinator = self.clone();
                            let gateway_config = gateway_config.clone();
                            let conversation_id = conversation_id.clone();
                            tokio::spawn(async move {
                                coordinator
                                    .compress_async(&conversation_id, &gateway_config)
                                    .await;
                            });
                        }
                    }
                }
            }
        }

        // Mid-term summarization on the turn threshold.
        if request.config.is_mid_term_enabled()
            && self.mid_term.is_some()
            && self.summary_gen.is_some()
        {
            self.clone().maybe_generate_summary(&request).await;
        }

        Ok(())
    }

    async fn maybe_generate_summary(self: Arc<Self>, request: &MemorizeRequest) {
        let conversation_id = &request.conversation_id;
        let threshold = request
            .config
            .mid_term
            .as_ref()
            .map(|c| c.summary_threshold())
            .unwrap_or_default();

        let turn_count = match self.short_term.turn_count(conversation_id).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to get turn count"
                );
                return;
            }
        };
        if turn_count < threshold {
            return;
        }

        let mid_term = self.mid_term.as_ref().expect("mid-term present");
        let existing = match mid_term
            .load_summary(request.scope.as_ref(), conversation_id)
            .await
        {
            Ok(existing) => existing,
            Err(err) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to load existing summary"
                );
                return;
            }
        };

        // Freshness guard: skip when the current summary already covers
        // most of the window.
        if let Some(existing) = &existing {
            if existing.turns_covered >= turn_count.saturating_sub(threshold / 2) {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    turns_covered = existing.turns_covered,
                    turn_count,
                    "summary recently generated, skipping"
                );
                return;
            }
        }

        tracing::info!(
            conversation_id = %conversation_id,
            turn_count,
            "triggering async summary generation"
        );
        let coordinator = self.clone();
        let scope = request.scope.clone();
        let conversation_id = conversation_id.clone();
        let existing_content = existing.map(|s| s.content).unwrap_or_default();
        tokio::spawn(async move {
            coordinator
                .generate_summary_async(scope, &conversation_id, &existing_content)
                .await;
        });
    }

    async fn generate_summary_async(
        self: Arc<Self>,
        scope: Option<TenantScope>,
        conversation_id: &str,
        existing_summary: &str,
    ) {
        let all_messages = match self.short_term.load(conversation_id, 0).await {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to load messages for summary"
                );
                return;
            }
        };
        if all_messages.is_empty() {
            return;
        }

        let summary_gen = self.summary_gen.as_ref().expect("summary generator present");
        let summary_text = match summary_gen.summarize(&all_messages, existing_summary).await {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "summary generation failed"
                );
                return;
            }
        };

        let summary = ConversationSummary {
            content: summary_text,
            turns_covered: all_messages.len() / 2,
            updated_at: Utc::now(),
        };

        let mid_term = self.mid_term.as_ref().expect("mid-term present");
        if let Err(err) = mid_term
            .save_summary(scope.as_ref(), conversation_id, &summary)
            .await
        {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %err,
                "failed to save summary"
            );
            return;
        }

        tracing::info!(
            conversation_id = %conversation_id,
            turns_covered = summary.turns_covered,
            "summary saved"
        );
    }

    /// The async compression pass: advisory lock, compress, reload and
    /// version-check, CAS-write. A version mismatch anywhere discards
    /// the result.
    async fn compress_async(self: Arc<Self>, conversation_id: &str, config: &GatewayConfig) {
        if let Some(lock) = &self.compress_lock {
            match lock.acquire(conversation_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        "compression skipped: lock not acquired"
                    );
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %err,
                        "failed to acquire compress lock"
                    );
                    return;
                }
            }
        }

        self.run_compression(conversation_id, config).await;

        if let Some(lock) = &self.compress_lock {
            if let Err(err) = lock.release(conversation_id).await {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to release compress lock"
                );
            }
        }
    }

    async fn run_compression(&self, conversation_id: &str, config: &GatewayConfig) {
        let Some(gateway) = &self.gateway else {
            return;
        };

        let state = match self.short_term.load_state(conversation_id).await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to load state for compression"
                );
                return;
            }
        };

        let (to_compress, to_keep) =
            select_messages_for_compression(&state.recent_messages, config.min_recent_turns());
        if to_compress.is_empty() {
            tracing::debug!(
                conversation_id = %conversation_id,
                total_messages = state.recent_messages.len(),
                "compression skipped: not enough messages"
            );
            return;
        }

        let result = match gateway
            .compress(
                &state.gateway_summary,
                &to_compress,
                &state.key_facts,
                config.extract_key_facts,
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "gateway compression failed"
                );
                return;
            }
        };

        // Optimistic check: a concurrent append means our input is stale.
        let current = match self.short_term.load_state(conversation_id).await {
            Ok(current) => current,
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to reload state for version check"
                );
                return;
            }
        };
        if current.version != state.version {
            tracing::warn!(
                conversation_id = %conversation_id,
                expected_version = state.version,
                current_version = current.version,
                "version mismatch, discarding compression result"
            );
            return;
        }

        let estimator = gateway.estimator();
        let expected_version = current.version;
        let mut updated = current;
        updated.gateway_summary = result.compressed_summary;
        updated.key_facts = result.key_facts;
        updated.recent_messages = to_keep.clone();
        updated.last_compressed_at = Utc::now().timestamp();
        updated.compressed_turn_count += (to_compress.len() / 2) as u32;
        updated.version = expected_version + 1;
        updated.token_estimate = estimate_stm_context(estimator.as_ref(), &updated);

        match self
            .short_term
            .save_state_if_version(conversation_id, &updated, expected_version)
            .await
        {
            Ok(true) => tracing::info!(
                conversation_id = %conversation_id,
                compressed_messages = to_compress.len(),
                remaining_messages = to_keep.len(),
                new_version = updated.version,
                "compression completed"
            ),
            Ok(false) => tracing::warn!(
                conversation_id = %conversation_id,
                expected_version,
                "compression save skipped due to version conflict"
            ),
            Err(err) => tracing::error!(
                conversation_id = %conversation_id,
                error = %err,
                "failed to save compressed state"
            ),
        }
    }
}
