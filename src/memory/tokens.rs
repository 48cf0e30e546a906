//! Token estimation for the compression trigger.

use crate::message::Message;

use super::config::GatewayConfig;
use super::stm::StmState;

/// Per-message role overhead, in tokens.
const MESSAGE_OVERHEAD: u64 = 4;

/// Estimates token counts for budget decisions.
pub trait TokenEstimator: Send + Sync {
    fn estimate_tokens(&self, text: &str) -> u64;
}

/// Conservative estimator: character count × 2⁄3 covers both dense
/// non-Latin scripts and sub-word Latin tokenization.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleTokenEstimator;

impl TokenEstimator for SimpleTokenEstimator {
    fn estimate_tokens(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars * 2 / 3
    }
}

/// Estimate a message list, adding the role overhead per message.
#[must_use]
pub fn estimate_messages(estimator: &dyn TokenEstimator, messages: &[Message]) -> u64 {
    messages
        .iter()
        .map(|m| MESSAGE_OVERHEAD + estimator.estimate_tokens(&m.content))
        .sum()
}

/// Estimate the whole STM context: gateway summary, key facts and recent
/// messages.
#[must_use]
pub fn estimate_stm_context(estimator: &dyn TokenEstimator, state: &StmState) -> u64 {
    let mut total = 0;

    if !state.gateway_summary.is_empty() {
        total += estimator.estimate_tokens(&state.gateway_summary) + MESSAGE_OVERHEAD;
    }

    if !state.key_facts.is_empty() {
        for (k, v) in &state.key_facts {
            total += estimator.estimate_tokens(&format!("{k}: {v}"));
        }
        total += MESSAGE_OVERHEAD;
    }

    total + estimate_messages(estimator, &state.recent_messages)
}

/// Whether the STM context exceeds the configured token budget.
#[must_use]
pub fn should_compress(
    estimator: &dyn TokenEstimator,
    state: &StmState,
    config: &GatewayConfig,
) -> bool {
    if !config.enabled {
        return false;
    }
    let threshold = (config.context_window_size() as f64 * config.token_threshold_ratio()) as u64;
    estimate_stm_context(estimator, state) > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn simple_estimator_scales_with_chars() {
        let est = SimpleTokenEstimator;
        assert_eq!(est.estimate_tokens(""), 0);
        assert_eq!(est.estimate_tokens("abcdef"), 4);
        // Multibyte characters count as characters, not bytes.
        assert_eq!(est.estimate_tokens("日本語"), 2);
    }

    #[test]
    fn message_overhead_is_added() {
        let est = SimpleTokenEstimator;
        let messages = vec![Message::user("abc"), Message::assistant("def")];
        assert_eq!(estimate_messages(&est, &messages), 4 + 2 + 4 + 2);
    }

    #[test]
    fn stm_context_sums_summary_facts_and_messages() {
        let est = SimpleTokenEstimator;
        let mut state = StmState::new("c1");
        state.gateway_summary = "summary".to_string();
        state.key_facts = BTreeMap::from([("goal".to_string(), "tokyo".to_string())]);
        state.recent_messages = vec![Message::user("hello")];

        let expected = est.estimate_tokens("summary")
            + 4
            + est.estimate_tokens("goal: tokyo")
            + 4
            + 4
            + est.estimate_tokens("hello");
        assert_eq!(estimate_stm_context(&est, &state), expected);
    }

    #[test]
    fn compression_triggers_above_threshold() {
        let est = SimpleTokenEstimator;
        let config = GatewayConfig {
            enabled: true,
            context_window_size: Some(100),
            token_threshold_ratio: Some(0.5),
            ..Default::default()
        };

        let mut state = StmState::new("c1");
        state.recent_messages = vec![Message::user("x".repeat(30))];
        assert!(!should_compress(&est, &state, &config));

        state.recent_messages = vec![Message::user("x".repeat(300))];
        assert!(should_compress(&est, &state, &config));

        let disabled = GatewayConfig::default();
        assert!(!should_compress(&est, &state, &disabled));
    }
}
